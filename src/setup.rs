//! First-run project setup: writes `.env.local` and `config/site.config.ts`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::distr::{Alphanumeric, SampleString};
use thiserror::Error;

pub const ENV_FILE: &str = ".env.local";
pub const SITE_CONFIG_FILE: &str = "config/site.config.ts";

const JWT_SECRET_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("setup already complete in {0} (use --force to overwrite)")]
    AlreadyComplete(PathBuf),
    #[error("failed to write setup files: {0}")]
    Io(#[from] io::Error),
}

/// Answers collected by the setup wizard.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupAnswers {
    pub site_name: String,
    pub site_url: String,
    pub primary_color: String,
    pub locale: String,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub anthropic_api_key: Option<String>,
    pub billing_webhook_secret: Option<String>,
}

impl Default for SetupAnswers {
    fn default() -> Self {
        Self {
            site_name: "Roomy".to_string(),
            site_url: "http://localhost:3000".to_string(),
            primary_color: "#2563EB".to_string(),
            locale: "ko".to_string(),
            database_url: None,
            jwt_secret: generate_secret(),
            anthropic_api_key: None,
            billing_webhook_secret: None,
        }
    }
}

impl SetupAnswers {
    /// Answers from `ROOMY_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            site_name: var("ROOMY_SITE_NAME").unwrap_or(defaults.site_name),
            site_url: var("ROOMY_SITE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.site_url),
            primary_color: var("ROOMY_PRIMARY_COLOR").unwrap_or(defaults.primary_color),
            locale: var("ROOMY_LOCALE").unwrap_or(defaults.locale),
            database_url: var("ROOMY_DATABASE_URL"),
            jwt_secret: var("ROOMY_JWT_SECRET").unwrap_or(defaults.jwt_secret),
            anthropic_api_key: var("ROOMY_ANTHROPIC_API_KEY"),
            billing_webhook_secret: var("ROOMY_BILLING_WEBHOOK_SECRET"),
        }
    }
}

fn generate_secret() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), JWT_SECRET_LEN)
}

/// True iff both generated files exist, whatever they contain.
pub fn is_setup_complete(dir: &Path) -> bool {
    dir.join(ENV_FILE).is_file() && dir.join(SITE_CONFIG_FILE).is_file()
}

/// Write both setup files under `dir`. Existing files are only replaced
/// when `force` is set.
pub fn write_setup_files(
    dir: &Path,
    answers: &SetupAnswers,
    force: bool,
) -> Result<Vec<PathBuf>, SetupError> {
    if !force && is_setup_complete(dir) {
        return Err(SetupError::AlreadyComplete(dir.to_path_buf()));
    }

    fs::create_dir_all(dir)?;
    let env_path = dir.join(ENV_FILE);
    let config_path = dir.join(SITE_CONFIG_FILE);

    let mut written = Vec::with_capacity(2);
    if force || !env_path.exists() {
        fs::write(&env_path, render_env(answers))?;
        written.push(env_path);
    }
    if force || !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&config_path, render_site_config(answers))?;
        written.push(config_path);
    }
    Ok(written)
}

pub fn render_env(answers: &SetupAnswers) -> String {
    let mut lines = vec![
        "# Generated by roomy-setup".to_string(),
        format!("SITE_URL={}", answers.site_url),
        format!("NEXT_PUBLIC_SITE_URL={}", answers.site_url),
        format!("JWT_SECRET={}", answers.jwt_secret),
    ];
    let optional = [
        ("DATABASE_URL", &answers.database_url),
        ("ANTHROPIC_API_KEY", &answers.anthropic_api_key),
        ("BILLING_WEBHOOK_SECRET", &answers.billing_webhook_secret),
    ];
    for (key, value) in optional {
        match value {
            Some(value) => lines.push(format!("{}={}", key, value)),
            None => lines.push(format!("# {}=", key)),
        }
    }
    lines.join("\n") + "\n"
}

/// JSON string literals are valid TypeScript string literals.
fn ts_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

pub fn render_site_config(answers: &SetupAnswers) -> String {
    format!(
        "// Generated by roomy-setup\n\
         export const siteConfig = {{\n  \
           name: {},\n  \
           url: {},\n  \
           primaryColor: {},\n  \
           locale: {},\n\
         }} as const;\n\
         \n\
         export type SiteConfig = typeof siteConfig;\n",
        ts_string(&answers.site_name),
        ts_string(&answers.site_url),
        ts_string(&answers.primary_color),
        ts_string(&answers.locale),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn answers() -> SetupAnswers {
        SetupAnswers {
            site_name: "Jeju \"Stay\"".to_string(),
            jwt_secret: "fixed-secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_dir_is_not_complete() {
        let dir = TempDir::new().unwrap();
        assert!(!is_setup_complete(dir.path()));
    }

    #[test]
    fn test_one_file_is_not_enough() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(ENV_FILE), "").unwrap();
        assert!(!is_setup_complete(dir.path()));

        let other = TempDir::new().unwrap();
        fs::create_dir_all(other.path().join("config")).unwrap();
        fs::write(other.path().join(SITE_CONFIG_FILE), "").unwrap();
        assert!(!is_setup_complete(other.path()));
    }

    #[test]
    fn test_completion_ignores_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(ENV_FILE), "").unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(dir.path().join(SITE_CONFIG_FILE), "garbage").unwrap();
        assert!(is_setup_complete(dir.path()));
    }

    #[test]
    fn test_write_then_refuse_without_force() {
        let dir = TempDir::new().unwrap();
        let written = write_setup_files(dir.path(), &answers(), false).unwrap();
        assert_eq!(written.len(), 2);
        assert!(is_setup_complete(dir.path()));

        let env = fs::read_to_string(dir.path().join(ENV_FILE)).unwrap();
        assert!(env.contains("JWT_SECRET=fixed-secret"));
        assert!(env.contains("# DATABASE_URL="));

        let again = write_setup_files(dir.path(), &answers(), false);
        assert!(matches!(again, Err(SetupError::AlreadyComplete(_))));

        let forced = write_setup_files(dir.path(), &answers(), true).unwrap();
        assert_eq!(forced.len(), 2);
    }

    #[test]
    fn test_creates_missing_project_dir() {
        let root = TempDir::new().unwrap();
        let project = root.path().join("fresh-project");

        let written = write_setup_files(&project, &answers(), false).unwrap();
        assert_eq!(written.len(), 2);
        assert!(is_setup_complete(&project));
    }

    #[test]
    fn test_partial_setup_fills_only_missing_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(ENV_FILE), "KEEP=1\n").unwrap();

        let written = write_setup_files(dir.path(), &answers(), false).unwrap();
        assert_eq!(written, vec![dir.path().join(SITE_CONFIG_FILE)]);
        assert_eq!(
            fs::read_to_string(dir.path().join(ENV_FILE)).unwrap(),
            "KEEP=1\n"
        );
    }

    #[test]
    fn test_site_config_escapes_strings() {
        let rendered = render_site_config(&answers());
        assert!(rendered.contains(r#"name: "Jeju \"Stay\"","#));
        assert!(rendered.contains("export const siteConfig"));
    }

    #[test]
    fn test_generated_secrets_differ() {
        let a = SetupAnswers::default();
        let b = SetupAnswers::default();
        assert_eq!(a.jwt_secret.len(), JWT_SECRET_LEN);
        assert_ne!(a.jwt_secret, b.jwt_secret);
    }
}
