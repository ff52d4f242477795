fn main() -> anyhow::Result<()> {
    isorun_cli::run()
}
