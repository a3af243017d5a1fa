//! The ARM7TDMI processor.
//!
//! [`arm7tdmi`] owns the fetch/decode/execute loop, the exception machinery,
//! and the memory-access helpers; [`arm`] and [`thumb`] each hold one
//! instruction set's decoder and handlers; [`alu`] is the barrel shifter and
//! flag arithmetic shared by both.

pub mod alu;
pub mod arm;
pub mod arm7tdmi;
pub mod condition;
pub mod cpu_modes;
pub mod psr;
pub mod registers;
pub mod thumb;
