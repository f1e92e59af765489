//! Roomy Backend - binary entry point
//! Delegates to the library for all app logic.

#[tokio::main]
async fn main() {
    roomy_backend::run().await;
}
