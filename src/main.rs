#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = omr_batch::run().await {
        eprintln!("omr-batch fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
