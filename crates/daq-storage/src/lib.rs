//! Persistence for acquired frame stacks.
//!
//! [`TiffStackWriter`] is the [`FrameSink`](daq_core::capabilities::FrameSink)
//! used at the end of a saving run; [`TiffWriter`] exposes the underlying
//! frame and stack encoding.

pub mod tiff_writer;

pub use tiff_writer::{TiffStackWriter, TiffWriter};
