use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::autosave::{AutoSaveEvent, StatusHandle};
use crate::model::PlanDocument;

use super::PlanSession;

enum Command {
    Edit(PlanDocument),
    ForceSave(Sender<Option<AutoSaveEvent>>),
    Shutdown(Sender<Option<AutoSaveEvent>>),
}

/// Owns a reconciled [`PlanSession`] on a background thread so edits never
/// wait on storage. The thread ticks the session every poll interval.
#[derive(Debug)]
pub struct SessionWorker {
    commands: Sender<Command>,
    events: Receiver<AutoSaveEvent>,
    status: StatusHandle,
    thread: Option<JoinHandle<()>>,
}

impl SessionWorker {
    pub fn spawn(session: PlanSession, poll_interval: Duration) -> Result<Self> {
        let (commands, inbox) = unbounded();
        let (events_tx, events) = unbounded();
        let status = session.status_handle();
        let thread = thread::Builder::new()
            .name("plansync-session".into())
            .spawn(move || run(session, inbox, events_tx, poll_interval))
            .context("spawning session worker")?;
        Ok(Self {
            commands,
            events,
            status,
            thread: Some(thread),
        })
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    /// Save outcomes produced so far.
    pub fn events(&self) -> &Receiver<AutoSaveEvent> {
        &self.events
    }

    pub fn edit(&self, document: PlanDocument) -> Result<()> {
        self.commands
            .send(Command::Edit(document))
            .map_err(|_| anyhow!("session worker has stopped"))
    }

    pub fn force_save(&self, timeout: Duration) -> Result<Option<AutoSaveEvent>> {
        let (reply, answer) = bounded(1);
        self.commands
            .send(Command::ForceSave(reply))
            .map_err(|_| anyhow!("session worker has stopped"))?;
        answer
            .recv_timeout(timeout)
            .context("waiting for forced save")
    }

    /// Flushes and closes the session. Gives up after `timeout`, leaving the
    /// thread to finish on its own.
    pub fn shutdown(mut self, timeout: Duration) -> Result<Option<AutoSaveEvent>> {
        let (reply, answer) = bounded(1);
        if self.commands.send(Command::Shutdown(reply)).is_err() {
            bail!("session worker has stopped");
        }
        match answer.recv_timeout(timeout) {
            Ok(event) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        tracing::warn!("session worker panicked during shutdown");
                    }
                }
                Ok(event)
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(?timeout, "session worker did not finish flushing in time");
                bail!("final save did not finish within {timeout:?}")
            }
            Err(RecvTimeoutError::Disconnected) => bail!("session worker exited before flushing"),
        }
    }
}

fn run(
    mut session: PlanSession,
    inbox: Receiver<Command>,
    events: Sender<AutoSaveEvent>,
    poll_interval: Duration,
) {
    let publish = |event: &Option<AutoSaveEvent>| {
        if let Some(event) = event {
            let _ = events.send(event.clone());
        }
    };
    loop {
        match inbox.recv_timeout(poll_interval) {
            Ok(Command::Edit(document)) => {
                session.edit(document);
            }
            Ok(Command::ForceSave(reply)) => {
                let event = session.force_save();
                publish(&event);
                let _ = reply.send(event);
            }
            Ok(Command::Shutdown(reply)) => {
                let event = session.close();
                publish(&event);
                let _ = reply.send(event);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                let event = session.tick();
                publish(&event);
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!("session handle dropped, flushing");
                let event = session.close();
                publish(&event);
                return;
            }
        }
    }
}
