//! The guest descriptor: the XML document the hypervisor exposes for a
//! guest, queried with element-path selectors supplied in configuration.

use crate::error::{MonitorError, Result};

const NAME_SELECTOR: &str = "/domain/name";
const KERNEL_SELECTOR: &str = "/domain/os/kernel";

/// A parsed guest descriptor.
///
/// Selectors are absolute element paths (`/domain/os/kernel`); a selector
/// resolves to the text content of the first matching element.
#[derive(Debug, Clone)]
pub struct GuestDescriptor {
    xml: String,
}

impl GuestDescriptor {
    /// Validate and wrap a descriptor document.
    pub fn parse(xml: String) -> Result<Self> {
        roxmltree::Document::parse(&xml)
            .map_err(|e| MonitorError::Descriptor(e.to_string()))?;
        Ok(GuestDescriptor { xml })
    }

    /// Resolve a selector to the text content of the first matching element.
    pub fn select_text(&self, selector: &str) -> Result<String> {
        let doc = roxmltree::Document::parse(&self.xml)
            .map_err(|e| MonitorError::Descriptor(e.to_string()))?;

        let mut parts = selector.trim_matches('/').split('/');
        let root = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| MonitorError::Descriptor(format!("empty selector {selector:?}")))?;

        let mut node = doc.root_element();
        if node.tag_name().name() != root {
            return Err(MonitorError::Descriptor(format!(
                "selector {selector:?} does not start at root element <{}>",
                node.tag_name().name()
            )));
        }
        for part in parts {
            node = node
                .children()
                .find(|c| c.is_element() && c.tag_name().name() == part)
                .ok_or_else(|| {
                    MonitorError::Descriptor(format!("no <{part}> element for {selector:?}"))
                })?;
        }

        node.text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| MonitorError::Descriptor(format!("{selector:?} has no text content")))
    }

    /// The guest's name.
    pub fn name(&self) -> Result<String> {
        self.select_text(NAME_SELECTOR)
    }

    /// Path of the guest's kernel image.
    pub fn kernel(&self) -> Result<String> {
        self.select_text(KERNEL_SELECTOR)
    }
}
