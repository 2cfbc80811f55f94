fn main() -> anyhow::Result<()> {
    raybar_lib::run()
}
