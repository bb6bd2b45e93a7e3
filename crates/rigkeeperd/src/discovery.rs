//! Service discovery records for the configured modems.
//!
//! Each launchable modem is announced as its own DNS-SD service so clients
//! can find both the modem port and the control port that launches it.
//! Publishing is delegated to a [`ServiceAdvertiser`].

use std::fmt;

use rigkeeper_core::{ModemRegistry, ModemType};
use thiserror::Error;
use tracing::{info, warn};

/// Service domain for every record.
pub const SERVICE_DOMAIN: &str = "local.";

/// TXT key carrying the control server port.
pub const TXT_LAUNCH_PORT: &str = "launchport";

/// TXT key carrying the CAT control port.
pub const TXT_CAT_PORT: &str = "catport";

/// TXT key carrying the CAT control dialect.
pub const TXT_CAT_DIALECT: &str = "catdialect";

/// Returns the DNS-SD service type advertised for a modem family.
pub fn service_type(modem_type: ModemType) -> &'static str {
    match modem_type {
        ModemType::Hf => "_varahf-modem._tcp",
        ModemType::Fm => "_varafm-modem._tcp",
    }
}

/// One service to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_type: &'static str,
    pub instance_name: String,
    pub domain: &'static str,
    /// The modem's own listening port
    pub port: u16,
    /// `key=value` attributes
    pub txt: Vec<String>,
}

impl ServiceRecord {
    /// Returns the value of TXT attribute `key`.
    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} port {}",
            self.instance_name, self.service_type, self.domain, self.port
        )
    }
}

/// Derives one record per modem that has an executable and a known port.
///
/// Modems whose port cannot be resolved are skipped with a warning.
pub fn records_for(registry: &ModemRegistry, control_port: u16) -> Vec<ServiceRecord> {
    let mut records = Vec::new();

    for modem in registry.iter() {
        let descriptor = modem.descriptor();
        if descriptor.cmd.trim().is_empty() {
            continue;
        }

        let Some(port) = descriptor.resolve_port() else {
            warn!(modem = %descriptor.name, "Modem port unknown, not advertising");
            continue;
        };

        let mut txt = vec![format!("{TXT_LAUNCH_PORT}={control_port}")];
        if let Some(cat) = &descriptor.cat_ctrl {
            if let Some(cat_port) = cat.port {
                txt.push(format!("{TXT_CAT_PORT}={cat_port}"));
                txt.push(format!("{TXT_CAT_DIALECT}={}", cat.dialect));
            }
        }

        records.push(ServiceRecord {
            service_type: service_type(descriptor.modem_type),
            instance_name: descriptor.name.clone(),
            domain: SERVICE_DOMAIN,
            port,
            txt,
        });
    }

    records
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to publish {record}: {reason}")]
    Publish { record: String, reason: String },
}

/// Publishes service records on the local network.
pub trait ServiceAdvertiser: Send {
    fn advertise(&mut self, records: &[ServiceRecord]) -> Result<(), DiscoveryError>;

    /// Withdraws everything published so far.
    fn shutdown(&mut self);
}

/// Advertiser that only logs what it would publish.
#[derive(Debug, Default)]
pub struct LogAdvertiser {
    published: Vec<ServiceRecord>,
}

impl LogAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> &[ServiceRecord] {
        &self.published
    }
}

impl ServiceAdvertiser for LogAdvertiser {
    fn advertise(&mut self, records: &[ServiceRecord]) -> Result<(), DiscoveryError> {
        for record in records {
            info!(
                service = %record.service_type,
                instance = %record.instance_name,
                domain = %record.domain,
                port = record.port,
                txt = ?record.txt,
                "Advertising service"
            );
        }
        self.published.extend_from_slice(records);
        Ok(())
    }

    fn shutdown(&mut self) {
        for record in self.published.drain(..) {
            info!(instance = %record.instance_name, "Withdrawing service");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigkeeper_core::{CatControl, ModemDescriptor};

    fn registry() -> ModemRegistry {
        let mut hf = ModemDescriptor::new("VARA HF", ModemType::Hf, "VARA.exe");
        hf.port = Some(8300);
        hf.cat_ctrl = Some(CatControl {
            cmd: Some("rigctld".to_string()),
            args: "-m 3073".to_string(),
            port: Some(4532),
            dialect: "hamlib".to_string(),
        });

        let mut fm = ModemDescriptor::new("VARA FM", ModemType::Fm, "VARAFM.exe");
        fm.port = Some(8400);

        // Neither a port nor a readable ini
        let unknown = ModemDescriptor::new("Mystery", ModemType::Hf, "/nonexistent/mystery.exe");

        ModemRegistry::new([hf, fm, unknown])
    }

    #[test]
    fn test_records_for() {
        let records = records_for(&registry(), 8273);
        assert_eq!(records.len(), 2);

        let hf = &records[0];
        assert_eq!(hf.service_type, "_varahf-modem._tcp");
        assert_eq!(hf.instance_name, "VARA HF");
        assert_eq!(hf.domain, "local.");
        assert_eq!(hf.port, 8300);
        assert_eq!(hf.txt_value("launchport"), Some("8273"));
        assert_eq!(hf.txt_value("catport"), Some("4532"));
        assert_eq!(hf.txt_value("catdialect"), Some("hamlib"));

        let fm = &records[1];
        assert_eq!(fm.service_type, "_varafm-modem._tcp");
        assert_eq!(fm.txt, vec!["launchport=8273".to_string()]);
    }

    #[test]
    fn test_port_from_ini() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("VARA.exe");
        std::fs::write(&exe, b"").unwrap();
        std::fs::write(dir.path().join("VARA.ini"), "[Setup]\nTCP Command Port=8500\n").unwrap();

        let descriptor = ModemDescriptor::new("HF", ModemType::Hf, exe.to_string_lossy());
        let records = records_for(&ModemRegistry::new([descriptor]), 1);
        assert_eq!(records[0].port, 8500);
    }

    #[test]
    fn test_log_advertiser() {
        let records = records_for(&registry(), 8273);
        let mut advertiser = LogAdvertiser::new();
        advertiser.advertise(&records).unwrap();
        assert_eq!(advertiser.published().len(), 2);
        assert!(records[0].to_string().starts_with("VARA HF._varahf-modem._tcp.local."));

        advertiser.shutdown();
        assert!(advertiser.published().is_empty());
    }
}
