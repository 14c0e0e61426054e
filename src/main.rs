#[tokio::main]
async fn main() -> eyre::Result<()> {
    leaseq::run().start().await
}
