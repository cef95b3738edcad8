//! Graph store abstraction.
//!
//! The patcher host owns the live document; the bridge only sees it through
//! this capability set. Handles are opaque and only valid against the store
//! that produced them.

pub mod patcher;

use std::fmt::Debug;
use std::hash::Hash;

use patchbridge_core::protocol::{Atom, Rect};
use serde_json::Value;

pub use patcher::{ObjectId, Patcher, Received};

/// What a store can do beyond the base capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Host protocol revision
    pub protocol: u32,
    /// Box display text can be read back (second-pass enrichment)
    pub box_text: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            protocol: 1,
            box_text: true,
        }
    }
}

/// One outbound connection of a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outgoing<H> {
    pub outlet: u32,
    pub dst: H,
    pub inlet: u32,
}

/// Operations the bridge needs from a live patcher document.
pub trait GraphStore {
    type Handle: Copy + Eq + Hash + Debug;

    fn capabilities(&self) -> Capabilities;

    /// Look a box up by its scripting name.
    fn get_named(&self, varname: &str) -> Option<Self::Handle>;

    /// Create a box of `class` with `args` at `(x, y)`.
    ///
    /// Returns `None` if the host refuses the class.
    fn new_default(&mut self, x: f64, y: f64, class: &str, args: &[Atom]) -> Option<Self::Handle>;

    fn set_varname(&mut self, handle: Self::Handle, varname: &str);

    /// Scripting name, `None` when the box is unnamed.
    fn varname(&self, handle: Self::Handle) -> Option<String>;

    /// Box class tag (`newobj`, `message`, `toggle`, ...).
    fn maxclass(&self, handle: Self::Handle) -> String;

    fn remove(&mut self, handle: Self::Handle);

    /// Returns false if either port does not exist.
    fn connect(&mut self, src: Self::Handle, outlet: u32, dst: Self::Handle, inlet: u32) -> bool;

    /// Returns false if there was no such connection.
    fn disconnect(&mut self, src: Self::Handle, outlet: u32, dst: Self::Handle, inlet: u32)
        -> bool;

    fn attr_names(&self, handle: Self::Handle) -> Vec<String>;

    fn get_attr(&self, handle: Self::Handle, name: &str) -> Option<Value>;

    /// Returns false if the box has no attribute `name` or the value does not fit.
    fn set_attr(&mut self, handle: Self::Handle, name: &str, value: Value) -> bool;

    /// Visit every box, nested ones included, and keep those matching `predicate`.
    fn apply_deep_if(&self, predicate: &mut dyn FnMut(Self::Handle) -> bool) -> Vec<Self::Handle>;

    fn outputs(&self, handle: Self::Handle) -> Vec<Outgoing<Self::Handle>>;

    fn num_inlets(&self, handle: Self::Handle) -> u32;

    fn num_outlets(&self, handle: Self::Handle) -> u32;

    fn rect(&self, handle: Self::Handle) -> Rect;

    fn is_selected(&self, handle: Self::Handle) -> bool;

    /// Current display text, if the box shows any.
    fn box_text(&self, handle: Self::Handle) -> Option<String>;

    /// Deliver `selector args...` to a box. Returns false if the box ignores it.
    fn send_message(&mut self, handle: Self::Handle, selector: &str, args: &[Atom]) -> bool;
}
