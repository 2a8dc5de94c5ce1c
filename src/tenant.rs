use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::engine::Engine;
use crate::limits::*;
use crate::model::Ms;
use crate::notify::NotifyHub;
use crate::reaper;

/// WAL file stem for an organization. Names are limited to ASCII letters,
/// digits, `_` and `-`, so the file stays inside the data directory. Upper-case
/// letters are written as `^` plus the lower-case letter: distinct names never
/// share a file, even on a case-insensitive filesystem.
pub fn wal_file_stem(org: &str) -> std::io::Result<String> {
    if org.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty organization name",
        ));
    }
    let mut stem = String::with_capacity(org.len());
    for c in org.chars() {
        match c {
            'a'..='z' | '0'..='9' | '_' | '-' => stem.push(c),
            'A'..='Z' => {
                stem.push('^');
                stem.push(c.to_ascii_lowercase());
            }
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid character {c:?} in organization name"),
                ));
            }
        }
    }
    Ok(stem)
}

/// Per-organization engine settings.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub compact_threshold: u64,
    pub hold_ttl_ms: Ms,
    pub sweep_interval: Duration,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 1_000,
            hold_ttl_ms: 15 * 60_000,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Manages per-organization engines. Each organization gets its own Engine,
/// WAL, hold-expiry sweep and compactor. Organization = database name from
/// the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    config: TenantConfig,
    clock: Arc<dyn Clock>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, config: TenantConfig) -> Self {
        Self::with_clock(data_dir, config, Arc::new(SystemClock))
    }

    pub fn with_clock(data_dir: PathBuf, config: TenantConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            config,
            clock,
        }
    }

    /// Get or lazily create the engine for an organization.
    pub fn get_or_create(&self, org: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(org) {
            return Ok(engine.value().clone());
        }
        if org.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "organization name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many organizations"));
        }

        let file_stem = wal_file_stem(org)?;

        // Two connections may race to open the same organization; the entry
        // lock makes sure only one engine owns the WAL.
        let entry = self.engines.entry(org.to_string()).or_try_insert_with(|| {
            let wal_path = self.data_dir.join(format!("{file_stem}.wal"));
            let engine = Arc::new(Engine::new(
                wal_path,
                Arc::new(NotifyHub::new()),
                self.clock.clone(),
                self.config.hold_ttl_ms,
            )?);

            tokio::spawn(reaper::run_reaper(engine.clone(), self.config.sweep_interval));
            tokio::spawn(reaper::run_compactor(
                engine.clone(),
                self.config.compact_threshold,
            ));
            tracing::info!(org, "organization engine started");
            Ok::<_, std::io::Error>(engine)
        })?;
        let engine = entry.value().clone();
        drop(entry);

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("allotd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn organizations_are_isolated() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, TenantConfig::default());

        let eng_a = tm.get_or_create("org_a").unwrap();
        let eng_b = tm.get_or_create("org_b").unwrap();

        // Same ids in both organizations.
        let unit_id = Ulid::new();
        let bucket_id = Ulid::new();
        for engine in [&eng_a, &eng_b] {
            engine.create_unit(unit_id, None).await.unwrap();
            engine
                .create_bucket(BucketSpec {
                    id: bucket_id,
                    unit_id,
                    supplier_id: Ulid::new(),
                    allocation_type: AllocationType::Committed,
                    priority: 0,
                    cost_per_unit: 0,
                    overbooking_limit: 0,
                })
                .await
                .unwrap();
            engine
                .set_bucket_capacity(bucket_id, NightRange::new(20_000, 20_001), 5)
                .await
                .unwrap();
        }

        eng_a
            .adjust(bucket_id, NightRange::new(20_000, 20_001), 3, 0)
            .await
            .unwrap();

        let a = eng_a.get_availability(unit_id, NightRange::new(20_000, 20_001)).await.unwrap();
        let b = eng_b.get_availability(unit_id, NightRange::new(20_000, 20_001)).await.unwrap();
        assert_eq!(a[0].booked, 3);
        assert_eq!(b[0].booked, 0);
    }

    #[tokio::test]
    async fn engine_created_lazily() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), TenantConfig::default());
        assert!(fs::read_dir(&dir).unwrap().next().is_none());

        let _eng = tm.get_or_create("acme_tours").unwrap();
        assert!(dir.join("acme_tours.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, TenantConfig::default());

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn unsafe_organization_names_rejected() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), TenantConfig::default());

        for name in ["../evil", "../..", "acme.", "a/b", "", "caf\u{e9}"] {
            let err = tm.get_or_create(name).err().unwrap();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput, "{name:?}");
        }
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
    }

    #[test]
    fn wal_file_stems_are_distinct() {
        assert_eq!(wal_file_stem("acme_tours-2").unwrap(), "acme_tours-2");
        assert_eq!(wal_file_stem("Acme").unwrap(), "^acme");
        assert_ne!(wal_file_stem("Acme").unwrap(), wal_file_stem("acme").unwrap());
        assert!(wal_file_stem("acme.").is_err());
    }

    #[tokio::test]
    async fn similar_names_do_not_share_a_log() {
        let dir = test_data_dir("similar_names");
        let tm = TenantManager::new(dir.clone(), TenantConfig::default());

        let unit_id = Ulid::new();
        tm.get_or_create("acme").unwrap().create_unit(unit_id, None).await.unwrap();
        assert!(tm.get_or_create("acme.").is_err());

        let upper = tm.get_or_create("ACME").unwrap();
        assert!(upper.list_units().is_empty());
        assert!(dir.join("acme.wal").exists());
        assert!(dir.join("^a^c^m^e.wal").exists());
    }

    #[tokio::test]
    async fn organization_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, TenantConfig::default());

        let err = tm
            .get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("organization name too long"));
        assert!(tm.get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN)).is_ok());
    }

    #[tokio::test]
    async fn organization_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, TenantConfig::default());

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many organizations"));
    }
}
