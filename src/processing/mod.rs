pub mod detectors;
pub mod filters;
pub mod shifts;
pub mod sorting;
