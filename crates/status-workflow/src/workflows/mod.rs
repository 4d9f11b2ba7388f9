pub mod status_change;
