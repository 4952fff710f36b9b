use crate::document::MigrationDocument;
use crate::registry::{Registry, assemble_document};
use crate::{MigrateError, Result, console};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Cloneable error carried inside shared cache futures. The original error
/// text is preserved so callers can still match on registry messages.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    message: String,
}

impl From<MigrateError> for FetchFailure {
    fn from(err: MigrateError) -> Self {
        FetchFailure {
            message: err.to_string(),
        }
    }
}

impl FetchFailure {
    fn into_error(self, package: &str, version: &str) -> MigrateError {
        MigrateError::FetchFailed {
            package: package.to_string(),
            version: version.to_string(),
            message: self.message,
        }
    }
}

type SharedFetch<T> = Shared<BoxFuture<'static, std::result::Result<T, FetchFailure>>>;

/// Resolves `name@range` to a concrete version and retrieves that version's
/// migration document. Both steps are memoized as in-flight futures so
/// concurrent callers for the same key join the same request.
pub struct Fetcher {
    registry: Arc<dyn Registry>,
    resolved_versions: Mutex<BTreeMap<String, SharedFetch<String>>>,
    migrations: Mutex<BTreeMap<String, SharedFetch<Arc<MigrationDocument>>>>,
}

impl Fetcher {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Fetcher {
            registry,
            resolved_versions: Mutex::new(BTreeMap::new()),
            migrations: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn fetch(&self, name: &str, version: &str) -> Result<Arc<MigrationDocument>> {
        let requested_key = cache_key(name, version);

        let cached = {
            let cache = self.migrations.lock().unwrap();
            cache.get(&requested_key).cloned()
        };
        if let Some(fut) = cached {
            return fut.await.map_err(|f| f.into_error(name, version));
        }

        let resolution = {
            let mut cache = self.resolved_versions.lock().unwrap();
            cache
                .entry(requested_key.clone())
                .or_insert_with(|| {
                    let registry = self.registry.clone();
                    let name = name.to_string();
                    let version = version.to_string();
                    async move {
                        registry
                            .resolve_version(&name, &version)
                            .await
                            .map_err(FetchFailure::from)
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        let resolved = resolution.await;

        if let Ok(resolved_version) = &resolved
            && resolved_version != version
        {
            let resolved_key = cache_key(name, resolved_version);
            let reusable = {
                let cache = self.migrations.lock().unwrap();
                cache.get(&resolved_key).cloned()
            };
            if let Some(fut) = reusable {
                self.migrations
                    .lock()
                    .unwrap()
                    .insert(requested_key, fut.clone());
                return fut.await.map_err(|f| f.into_error(name, version));
            }
        }

        let candidate = {
            let registry = self.registry.clone();
            let name = name.to_string();
            let requested = version.to_string();
            let resolved = resolved.clone();
            async move {
                if let Ok(resolved_version) = &resolved {
                    match registry_document(registry.as_ref(), &name, resolved_version).await {
                        Ok(document) => return Ok(Arc::new(document)),
                        Err(err) => console::verbose(&format!(
                            "falling back to install-based fetch for {}@{}: {}",
                            name, resolved_version, err
                        )),
                    }
                } else if let Err(err) = &resolved {
                    console::verbose(&format!(
                        "version resolution failed for {}@{}: {}",
                        name, requested, err.message
                    ));
                }

                let target = match &resolved {
                    Ok(resolved_version) => resolved_version.clone(),
                    Err(_) => requested.clone(),
                };
                let installed = registry
                    .install_migrations(&name, &target)
                    .await
                    .map_err(FetchFailure::from)?;
                Ok(Arc::new(assemble_document(
                    installed.version,
                    installed.meta,
                    installed.migrations,
                )))
            }
            .boxed()
            .shared()
        };

        // Shared futures are lazy, so a losing candidate never runs.
        let fut = {
            let mut cache = self.migrations.lock().unwrap();
            let fut = cache
                .entry(requested_key)
                .or_insert_with(|| candidate)
                .clone();
            if let Ok(resolved_version) = &resolved
                && resolved_version != version
            {
                cache
                    .entry(cache_key(name, resolved_version))
                    .or_insert_with(|| fut.clone());
            }
            fut
        };

        fut.await.map_err(|f| f.into_error(name, version))
    }
}

async fn registry_document(
    registry: &dyn Registry,
    name: &str,
    version: &str,
) -> Result<MigrationDocument> {
    let Some(meta) = registry.migration_meta(name, version).await? else {
        return Ok(MigrationDocument::bare(version));
    };

    match meta.migrations_path.clone() {
        None => Ok(assemble_document(version.to_string(), Some(meta), None)),
        Some(path) => {
            let raw = registry.fetch_migrations(name, version, &path).await?;
            Ok(assemble_document(version.to_string(), Some(meta), Some(raw)))
        }
    }
}

fn cache_key(name: &str, version: &str) -> String {
    format!("{}-{}", name, version)
}
