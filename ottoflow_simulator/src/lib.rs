//! In-process stand-ins for printers and the Ottoeject. Used by the test suites
//! and by `ottoflow --simulate` for dry runs without hardware.

pub mod ottoeject;
pub mod printer;

pub use ottoeject::SimulatedOttoeject;
pub use printer::SimulatedPrinter;
