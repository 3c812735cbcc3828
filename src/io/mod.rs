mod ascii;
mod coefficients;
mod psp;

pub use ascii::read_ascii_bodies;
pub use coefficients::read_coefficients;
pub use coefficients::write_coefficients;
pub use coefficients::CoefDump;
pub use psp::read_dump;
pub use psp::write_dump;
pub use psp::ComponentStanza;
pub use psp::DumpHeader;
pub use psp::FloatKind;
