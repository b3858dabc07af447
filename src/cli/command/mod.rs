pub mod hrrr;
pub mod ornl;
pub mod prism;
pub mod snotel;
pub mod wrf;

pub use hrrr::hrrr;
pub use ornl::ornl;
pub use prism::prism;
pub use snotel::snotel;
pub use wrf::wrf;
