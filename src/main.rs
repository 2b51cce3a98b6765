#[tokio::main]
async fn main() -> anyhow::Result<()> {
    drivewatch_lib::run().await
}
