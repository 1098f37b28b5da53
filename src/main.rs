use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    sandbot::cli::run().await
}
