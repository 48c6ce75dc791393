//! Load-time file-hash module.
//!
//! Measures SHA-1 digests of files named by the guest's configuration
//! descriptor before the guest is launched. Each option in the module's
//! configuration table is an element-path selector into the descriptor;
//! the selector resolves to a file path on the host, and the digest of that
//! file's contents becomes the measurement.

use std::collections::HashMap;
use std::fs;

use sha1::{Digest, Sha1};

use crate::config::{Config, Criteria};
use crate::descriptor::GuestDescriptor;
use crate::error::{MonitorError, Result};
use crate::modules::{InitContext, IntrospectionModule, ModuleKind, Watchpoint};

const NAME: &str = "FileHash";

pub(crate) fn ctor(cfg: &Config) -> Result<Box<dyn IntrospectionModule>> {
    Ok(Box::new(FileHash::from_config(cfg)?))
}

/// Static module measuring SHA-1 digests of descriptor-resolved files.
pub struct FileHash {
    selectors: Vec<(String, String)>,
    hashes: HashMap<String, String>,
}

impl FileHash {
    /// Build the module from its configuration table (option → selector).
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let section = cfg.module_section(NAME).ok_or_else(|| {
            MonitorError::Config(format!("module {NAME} is enabled but has no section"))
        })?;
        let mut selectors = Vec::with_capacity(section.len());
        for (option, value) in section {
            let selector = value.as_str().ok_or_else(|| {
                MonitorError::Config(format!("{NAME}.{option}: selector must be a string"))
            })?;
            selectors.push((option.clone(), selector.to_string()));
        }
        Ok(FileHash {
            selectors,
            hashes: HashMap::new(),
        })
    }

    fn measure(&mut self, descriptor: &GuestDescriptor) -> Result<()> {
        for (option, selector) in &self.selectors {
            let path = descriptor.select_text(selector)?;
            let bytes = fs::read(&path).map_err(|e| {
                MonitorError::Config(format!("{NAME}.{option}: cannot read {path}: {e}"))
            })?;
            let digest = hex::encode(Sha1::digest(&bytes));
            tracing::debug!(option, path, digest, "measured load-time artifact");
            self.hashes.insert(option.clone(), digest);
        }
        Ok(())
    }
}

impl IntrospectionModule for FileHash {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Static
    }

    fn initialize(&mut self, ctx: InitContext<'_>) -> Result<Vec<Watchpoint>> {
        let InitContext::LoadTime(descriptor) = ctx else {
            return Err(MonitorError::Config(format!(
                "{NAME} is a load-time module"
            )));
        };
        self.measure(descriptor)?;
        Ok(Vec::new())
    }

    fn check(&self, criteria: &Criteria) -> bool {
        let Some(section) = criteria.section(NAME) else {
            return true;
        };
        for (option, expected) in section {
            if expected.as_str() != self.hashes.get(option).map(String::as_str) {
                tracing::debug!(option, "file hash criteria rejected");
                return false;
            }
        }
        true
    }
}
