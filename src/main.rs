#[tokio::main]
async fn main() -> anyhow::Result<()> {
    capsule_mesh::run().await
}
