use std::env;

#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub default_registry: String,
    pub auth_token: Option<String>,
    pub skip_install: bool,
    pub verbose: bool,
}

impl MigrateConfig {
    pub fn from_env() -> Self {
        let mut default_registry = "https://registry.npmjs.org".to_string();
        if let Ok(value) =
            env::var("NPM_CONFIG_REGISTRY").or_else(|_| env::var("npm_config_registry"))
        {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                default_registry = trimmed.trim_end_matches('/').to_string();
            }
        }

        let mut auth_token = None;
        if let Ok(token) = env::var("NODE_AUTH_TOKEN").or_else(|_| env::var("NPM_TOKEN")) {
            let trimmed = token.trim();
            if !trimmed.is_empty() {
                auth_token = Some(trimmed.to_string());
            }
        }

        MigrateConfig {
            default_registry,
            auth_token,
            skip_install: env_truthy("NX_MIGRATE_SKIP_INSTALL"),
            verbose: env::var_os("NX_VERBOSE_LOGGING").is_some(),
        }
    }
}

fn env_truthy(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            !trimmed.is_empty() && trimmed != "0" && !trimmed.eq_ignore_ascii_case("false")
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_is_npm() {
        if env::var_os("NPM_CONFIG_REGISTRY").is_none() {
            let config = MigrateConfig::from_env();
            assert_eq!(config.default_registry, "https://registry.npmjs.org");
        }
    }
}
