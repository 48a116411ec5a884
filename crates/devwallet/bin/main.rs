//! The `devwallet` CLI: background coordinator of the QA dev wallet.

fn main() {
    if let Err(err) = devwallet::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
