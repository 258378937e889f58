//! Version command implementation.

/// Execute the version command.
pub fn execute(json: bool) {
    let version = env!("CARGO_PKG_VERSION");
    if json {
        println!("{}", serde_json::json!({"version": version}));
    } else {
        println!("mt {version}");
    }
}
