pub mod egress_path;
pub mod shaping;
pub mod tsa;
