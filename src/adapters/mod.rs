//! Vendor adapter registry. Resolves a printer record's brand to the tagged
//! vendor implementation that drives it.

pub mod moonraker;

pub use moonraker::MoonrakerAdapter;

use ottoflow_shared::config::MoonrakerConfig;
use ottoflow_shared::model::{PrinterId, PrinterRecord};
use ottoflow_shared::{AdapterError, PrinterAdapter};
use ottoflow_simulator::SimulatedPrinter;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Moonraker,
    Simulated,
}

impl Vendor {
    /// Case-insensitive brand lookup, including common aliases.
    pub fn from_brand(brand: &str) -> Option<Vendor> {
        let brand = brand.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
        match brand.as_str() {
            "moonraker" | "klipper" | "anycubic" | "voron" | "ratrig" => Some(Vendor::Moonraker),
            "simulated" | "simulator" | "sim" | "virtual" => Some(Vendor::Simulated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::Moonraker => "moonraker",
            Vendor::Simulated => "simulated",
        }
    }
}

pub type AdapterFactory =
    Arc<dyn Fn(&PrinterRecord) -> Result<Arc<dyn PrinterAdapter>, AdapterError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<Vendor, AdapterFactory>,
    instances: HashMap<PrinterId, Arc<dyn PrinterAdapter>>,
    fallback: Option<AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(moonraker: &MoonrakerConfig) -> Self {
        let mut registry = Self::new();
        let moonraker = moonraker.clone();
        registry.register(
            Vendor::Moonraker,
            Arc::new(move |record: &PrinterRecord| {
                let adapter: Arc<dyn PrinterAdapter> = Arc::new(MoonrakerAdapter::new(record, &moonraker)?);
                Ok(adapter)
            }),
        );
        registry.register(Vendor::Simulated, simulated_factory());
        registry
    }

    /// Every printer gets a simulated adapter, whatever its brand.
    pub fn simulated() -> Self {
        let mut registry = Self::new();
        registry.fallback = Some(simulated_factory());
        registry
    }

    pub fn register(&mut self, vendor: Vendor, factory: AdapterFactory) {
        self.factories.insert(vendor, factory);
    }

    /// Pins a ready-made adapter to one printer id, ahead of any brand lookup.
    pub fn register_instance(&mut self, printer_id: PrinterId, adapter: Arc<dyn PrinterAdapter>) {
        self.instances.insert(printer_id, adapter);
    }

    pub fn build(&self, record: &PrinterRecord) -> Result<Arc<dyn PrinterAdapter>, AdapterError> {
        if let Some(adapter) = self.instances.get(&record.id) {
            return Ok(adapter.clone());
        }
        let factory = Vendor::from_brand(&record.brand)
            .and_then(|vendor| self.factories.get(&vendor))
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                AdapterError::Unsupported(format!("printer brand '{}'", record.brand))
            })?;
        factory(record)
    }
}

fn simulated_factory() -> AdapterFactory {
    Arc::new(|record: &PrinterRecord| {
        let adapter: Arc<dyn PrinterAdapter> = Arc::new(SimulatedPrinter::new(record.name.clone()));
        Ok(adapter)
    })
}
