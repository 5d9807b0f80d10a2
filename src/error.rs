use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Couldn't open the backing file
    #[error("Opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file
    #[error("Failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't truncate the backing file while opening it
    #[error("Truncating the backing file failed")]
    Truncate(#[source] std::io::Error),
    #[error(
        "System page size 0x{page_size:x} is incompatible with the 0x{unit:x} byte mapping unit"
    )]
    PageSize { page_size: usize, unit: u64 },
}
