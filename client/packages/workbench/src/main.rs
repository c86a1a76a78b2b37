fn main() {
    if let Err(err) = workbench::cli::run_workbench() {
        tracing::error!(error = %err, "workbench failed");
        std::process::exit(1);
    }
}
