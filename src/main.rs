use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    imgcrypt::run().await
}
