use cli::Cli;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // capnp-rpc futures are !Send, so everything runs on one LocalSet.
    let local = tokio::task::LocalSet::new();
    let result = local.run_until(Cli::run()).await;
    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
