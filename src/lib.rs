// simbridge: procedural-interface bridge for HDL simulators.
//
// Copyright (C) 2020  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

// One uniform, language-neutral surface over the three procedural
// interfaces HDL simulators export (Verilog VPI, VHDL VHPI, ModelSim
// FLI), consumed by a hosted test runtime through a small C ABI.
//
// The simulator loads this crate as a shared library and announces
// itself through whichever startup table it honors; the matching
// backend probes the process image for its entry points and registers
// itself. From then on the facade owns every handle crossing the
// boundary, the callback model keeps the kernel's firing rules honest,
// and the embedding surface shepherds the hosted runtime through
// startup and shutdown.

extern crate enumflags2;
extern crate libloading;
extern crate log;
extern crate num_enum;
extern crate regex;
#[macro_use]
extern crate lazy_static;

pub mod arena;
pub mod backend;
pub mod callback;
pub mod embed;
pub mod error;
pub mod extra;
pub mod facade;
pub mod fli;
pub mod loader;
pub mod logging;
pub mod naming;
pub mod object;
pub mod value;
pub mod vhpi;
pub mod vpi;

#[cfg(test)]
pub mod mock;

pub use crate::error::{Error, Result};
pub use crate::object::ObjectKind;
