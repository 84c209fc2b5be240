#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod fs;
pub mod hal;
pub mod utils;
