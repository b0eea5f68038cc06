mod entry;
mod microformats;

pub use entry::Entry;
pub use microformats::Microformats2;
