use roomy_backend::setup::{
    is_setup_complete, write_setup_files, SetupAnswers, SetupError, ENV_FILE, SITE_CONFIG_FILE,
};
use std::env;
use std::path::PathBuf;

fn main() {
    let mut dir = PathBuf::from(".");
    let mut force = false;

    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--force" | "-f" => force = true,
            "--help" | "-h" => {
                println!("Usage: roomy-setup [DIR] [--force]");
                println!();
                println!("Writes {} and {} under DIR.", ENV_FILE, SITE_CONFIG_FILE);
                println!("Answers come from ROOMY_SITE_NAME, ROOMY_SITE_URL, ROOMY_PRIMARY_COLOR,");
                println!("ROOMY_LOCALE, ROOMY_DATABASE_URL, ROOMY_JWT_SECRET,");
                println!("ROOMY_ANTHROPIC_API_KEY and ROOMY_BILLING_WEBHOOK_SECRET.");
                return;
            }
            other => dir = PathBuf::from(other),
        }
    }

    if is_setup_complete(&dir) && !force {
        println!("Setup already complete in {}. Nothing to do.", dir.display());
        println!("Run with --force to regenerate both files.");
        return;
    }

    match write_setup_files(&dir, &SetupAnswers::from_env(), force) {
        Ok(written) => {
            for path in written {
                println!("wrote {}", path.display());
            }
            println!("\nSetup complete.");
        }
        Err(SetupError::AlreadyComplete(path)) => {
            println!("Setup already complete in {}.", path.display());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
