//! HTML extraction for the court's listing and decision pages.

pub mod decision;
pub mod listing;
