//! Decoders turning raw downloaded files into datasets.

pub mod awdb;
pub mod bil;
pub mod grib;
pub mod lambert;
pub mod netcdf;
