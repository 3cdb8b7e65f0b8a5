pub mod rate_meter;
