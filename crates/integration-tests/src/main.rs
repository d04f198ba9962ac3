fn main() -> color_eyre::Result<()> {
    integration_tests::run_tests()
}
