//! Ottoeject macro names and the per-printer eject sequence.

pub const HOME: &str = "OTTOEJECT_HOME";
pub const PARK: &str = "PARK_OTTOEJECT";

/// Printer families the ejector has dedicated motions for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterProfile {
    BambuA1,
    BambuP1s,
    BambuX1c,
    BambuP1p,
    AnycubicKobraS1,
    ElegooCentauriCarbon,
    CrealityK1c,
    FlashforgeAd5x,
    Generic,
}

impl PrinterProfile {
    pub fn detect(brand: &str, model: &str) -> Self {
        let brand = normalize(brand);
        let model = normalize(model);
        if brand.contains("bambu") {
            return match model.as_str() {
                "a1" | "a1mini" => PrinterProfile::BambuA1,
                "p1s" => PrinterProfile::BambuP1s,
                "x1c" | "x1carbon" => PrinterProfile::BambuX1c,
                "p1p" => PrinterProfile::BambuP1p,
                _ => PrinterProfile::Generic,
            };
        }
        if brand.contains("anycubic") && model.contains("kobras1") {
            return PrinterProfile::AnycubicKobraS1;
        }
        if brand.contains("elegoo") && (model.contains("centauri") || model.contains("carbon")) {
            return PrinterProfile::ElegooCentauriCarbon;
        }
        if brand.contains("creality") && model == "k1c" {
            return PrinterProfile::CrealityK1c;
        }
        if brand.contains("flashforge") && model == "ad5x" {
            return PrinterProfile::FlashforgeAd5x;
        }
        PrinterProfile::Generic
    }

    pub fn eject_macro(self) -> &'static str {
        match self {
            PrinterProfile::BambuA1 => "EJECT_FROM_BAMBULAB_A_ONE",
            PrinterProfile::BambuP1s | PrinterProfile::BambuX1c => "EJECT_FROM_BAMBULAB_P_ONE_S",
            PrinterProfile::BambuP1p => "EJECT_FROM_BAMBULAB_P_ONE_P",
            PrinterProfile::AnycubicKobraS1 => "EJECT_FROM_ANYCUBIC_KOBRA_S_ONE",
            PrinterProfile::ElegooCentauriCarbon => "EJECT_FROM_ELEGOO_CC",
            PrinterProfile::CrealityK1c => "EJECT_FROM_CREALITY_K_ONE_C",
            PrinterProfile::FlashforgeAd5x => "EJECT_FROM_FLASHFORGE_AD_FIVE_X",
            PrinterProfile::Generic => "EJECT_FROM_GENERIC_PRINTER",
        }
    }

    /// Only enclosed printers get their door closed.
    pub fn door_macro(self) -> Option<&'static str> {
        match self {
            PrinterProfile::BambuP1s | PrinterProfile::BambuX1c => Some("CLOSE_DOOR_BAMBULAB_P_ONE_S"),
            _ => None,
        }
    }

    /// G-code sent to the printer so the bed is reachable by the ejector.
    pub fn bed_positioning(self) -> Option<&'static str> {
        match self {
            PrinterProfile::BambuA1 => Some("G90\nG1 Y170 F600"),
            PrinterProfile::BambuP1s
            | PrinterProfile::BambuX1c
            | PrinterProfile::BambuP1p
            | PrinterProfile::FlashforgeAd5x => Some("G90\nG1 Z200 F600"),
            _ => None,
        }
    }
}

fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn store_to_slot(slot: u32) -> String {
    format!("STORE_TO_SLOT_{}", slot)
}

/// Ordered ejector macros for one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EjectPlan {
    pub bed_positioning: Option<&'static str>,
    pub macros: Vec<String>,
}

impl EjectPlan {
    /// `last_job` closes the door behind the final part of a printer's queue.
    pub fn new(profile: PrinterProfile, slot: u32, last_job: bool) -> Self {
        let mut macros = vec![HOME.to_string(), profile.eject_macro().to_string(), store_to_slot(slot)];
        if last_job {
            if let Some(door) = profile.door_macro() {
                macros.push(door.to_string());
            }
        }
        macros.push(PARK.to_string());
        Self { bed_positioning: profile.bed_positioning(), macros }
    }
}
