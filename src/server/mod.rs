//! Network listener.

pub mod listener;
