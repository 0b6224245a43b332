mod app;
mod extract;
mod payments;
mod session_window;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
