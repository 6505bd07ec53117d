fn main() -> anyhow::Result<()> {
    plansync::cli::run()
}
