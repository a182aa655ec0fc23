#[cfg(feature = "capstone-backend")]
pub mod capstone;
#[cfg(feature = "rizin-backend")]
pub mod rizin;

#[cfg(feature = "capstone-backend")]
pub use capstone::CapstoneBackend;
#[cfg(feature = "rizin-backend")]
pub use rizin::RizinBackend;
