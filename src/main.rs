fn main() -> anyhow::Result<()> {
    panelcore::cli::run_cli()
}
