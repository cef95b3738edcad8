//! In-memory patcher document.
//!
//! Boxes are kept in creation order, which is also traversal order. Object
//! boxes (`newobj`) show `class args...` as their text; UI boxes (message,
//! number, toggle, ...) carry their own class tag and state.

use patchbridge_core::protocol::{atoms_to_text, Atom, Rect};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{Capabilities, GraphStore, Outgoing};

/// Stable handle to a box. Never reused within one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

/// A message a box received through [`GraphStore::send_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub selector: String,
    pub args: Vec<Atom>,
}

/// Classes drawn as their own box type rather than as `newobj`.
const UI_CLASSES: &[&str] = &[
    "message", "comment", "number", "flonum", "toggle", "button", "slider", "dial", "ezdac~",
    "gain~",
];

/// Inlet and outlet counts by class.
fn ports(class: &str) -> (u32, u32) {
    match class {
        "message" => (2, 1),
        "comment" => (1, 0),
        "number" | "flonum" => (1, 2),
        "toggle" | "button" | "slider" | "dial" => (1, 1),
        "ezdac~" | "dac~" => (2, 0),
        "gain~" => (2, 2),
        "cycle~" | "*~" | "+~" | "-~" | "metro" | "line~" => (2, 1),
        "print" => (1, 0),
        "loadbang" => (1, 1),
        _ => (1, 1),
    }
}

fn default_size(maxclass: &str, text: &str) -> (f64, f64) {
    match maxclass {
        "toggle" | "button" => (24.0, 24.0),
        "number" | "flonum" => (50.0, 22.0),
        "comment" => (150.0, 20.0),
        "slider" => (20.0, 140.0),
        "dial" => (40.0, 40.0),
        "ezdac~" => (45.0, 45.0),
        "gain~" => (22.0, 140.0),
        _ => ((text.chars().count() as f64 * 7.0 + 16.0).max(30.0), 22.0),
    }
}

#[derive(Debug, Clone)]
struct PatcherBox {
    id: ObjectId,
    maxclass: String,
    class: String,
    args: Vec<Atom>,
    varname: Option<String>,
    rect: Rect,
    numinlets: u32,
    numoutlets: u32,
    attrs: Map<String, Value>,
    selected: bool,
    /// Message/comment content
    text: String,
    /// Number/toggle state
    value: Option<Atom>,
    received: Vec<Received>,
}

impl PatcherBox {
    fn display_text(&self) -> Option<String> {
        match self.maxclass.as_str() {
            "newobj" => {
                if self.args.is_empty() {
                    Some(self.class.clone())
                } else {
                    Some(format!("{} {}", self.class, atoms_to_text(&self.args)))
                }
            }
            "message" | "comment" => Some(self.text.clone()),
            "number" | "flonum" => self.value.as_ref().map(|v| v.to_string()),
            _ => None,
        }
    }

    fn apply_message(&mut self, selector: &str, args: &[Atom]) -> bool {
        let first = args.first().and_then(Atom::as_f64);
        match (self.maxclass.as_str(), selector) {
            ("message" | "comment", "set") => {
                self.text = atoms_to_text(args);
                true
            }
            ("number", "set" | "int" | "float") => match first {
                Some(v) => {
                    self.value = Some(Atom::Int(v.trunc() as i64));
                    true
                }
                None => false,
            },
            ("flonum", "set" | "int" | "float") => match first {
                Some(v) => {
                    self.value = Some(Atom::Float(v));
                    true
                }
                None => false,
            },
            ("toggle", "set" | "int" | "float") => match first {
                Some(v) => {
                    self.value = Some(Atom::Int((v != 0.0) as i64));
                    true
                }
                None => false,
            },
            ("toggle", "bang") => {
                let on = matches!(self.value, Some(Atom::Int(1)));
                self.value = Some(Atom::Int((!on) as i64));
                true
            }
            (_, "bang") => true,
            ("newobj", _) => true,
            ("message" | "button" | "slider" | "dial", "int" | "float" | "list") => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Cord {
    src: ObjectId,
    outlet: u32,
    dst: ObjectId,
    inlet: u32,
}

/// A flat, single-level patcher held in memory.
#[derive(Debug, Clone)]
pub struct Patcher {
    boxes: Vec<PatcherBox>,
    cords: Vec<Cord>,
    next_id: u64,
    capabilities: Capabilities,
}

impl Default for Patcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Patcher {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            boxes: Vec::new(),
            cords: Vec::new(),
            next_id: 1,
            capabilities,
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Number of patch cords.
    pub fn cord_count(&self) -> usize {
        self.cords.len()
    }

    /// Create a box and give it a name in one step.
    pub fn add(&mut self, class: &str, x: f64, y: f64, varname: Option<&str>) -> ObjectId {
        self.add_with_args(class, &[], x, y, varname)
    }

    pub fn add_with_args(
        &mut self,
        class: &str,
        args: &[Atom],
        x: f64,
        y: f64,
        varname: Option<&str>,
    ) -> ObjectId {
        let id = self.create(x, y, class, args);
        if let Some(name) = varname {
            self.set_varname(id, name);
        }
        id
    }

    pub fn select(&mut self, id: ObjectId, selected: bool) {
        if let Some(b) = self.get_mut(id) {
            b.selected = selected;
        }
    }

    /// Current number/toggle value.
    pub fn value(&self, id: ObjectId) -> Option<&Atom> {
        self.get(id).and_then(|b| b.value.as_ref())
    }

    /// Messages delivered to a box so far.
    pub fn received(&self, id: ObjectId) -> &[Received] {
        self.get(id).map(|b| b.received.as_slice()).unwrap_or(&[])
    }

    fn get(&self, id: ObjectId) -> Option<&PatcherBox> {
        self.boxes.iter().find(|b| b.id == id)
    }

    fn get_mut(&mut self, id: ObjectId) -> Option<&mut PatcherBox> {
        self.boxes.iter_mut().find(|b| b.id == id)
    }

    fn create(&mut self, x: f64, y: f64, class: &str, args: &[Atom]) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;

        let maxclass = if UI_CLASSES.contains(&class) {
            class.to_string()
        } else {
            "newobj".to_string()
        };
        let (numinlets, numoutlets) = ports(class);

        let mut b = PatcherBox {
            id,
            maxclass,
            class: class.to_string(),
            args: args.to_vec(),
            varname: None,
            rect: Rect::default(),
            numinlets,
            numoutlets,
            attrs: default_attrs(class),
            selected: false,
            text: String::new(),
            value: None,
            received: Vec::new(),
        };
        match b.maxclass.as_str() {
            "message" | "comment" => b.text = atoms_to_text(args),
            "number" | "toggle" => b.value = Some(Atom::Int(0)),
            "flonum" => b.value = Some(Atom::Float(0.0)),
            _ => {}
        }
        let text = b.display_text().unwrap_or_default();
        let (width, height) = default_size(&b.maxclass, &text);
        b.rect = Rect::new(x, y, width, height);

        debug!(?id, class, "Created box");
        self.boxes.push(b);
        id
    }
}

fn default_attrs(class: &str) -> Map<String, Value> {
    let mut attrs = Map::new();
    attrs.insert("fontname".into(), json!("Arial"));
    attrs.insert("fontsize".into(), json!(12.0));
    attrs.insert("hidden".into(), json!(0));
    attrs.insert("presentation".into(), json!(0));
    attrs.insert("bgcolor".into(), json!([1.0, 1.0, 1.0, 1.0]));
    match class {
        "number" | "flonum" => {
            attrs.insert("minimum".into(), Value::Null);
            attrs.insert("maximum".into(), Value::Null);
        }
        "toggle" => {
            attrs.insert("checkedcolor".into(), json!([0.8, 0.8, 0.8, 1.0]));
        }
        "comment" => {
            attrs.insert("textcolor".into(), json!([0.0, 0.0, 0.0, 1.0]));
        }
        _ => {}
    }
    attrs
}

impl GraphStore for Patcher {
    type Handle = ObjectId;

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn get_named(&self, varname: &str) -> Option<ObjectId> {
        self.boxes
            .iter()
            .find(|b| b.varname.as_deref() == Some(varname))
            .map(|b| b.id)
    }

    fn new_default(&mut self, x: f64, y: f64, class: &str, args: &[Atom]) -> Option<ObjectId> {
        if class.trim().is_empty() || class.chars().any(char::is_whitespace) {
            return None;
        }
        Some(self.create(x, y, class, args))
    }

    fn set_varname(&mut self, handle: ObjectId, varname: &str) {
        if let Some(b) = self.get_mut(handle) {
            b.varname = if varname.is_empty() {
                None
            } else {
                Some(varname.to_string())
            };
        }
    }

    fn varname(&self, handle: ObjectId) -> Option<String> {
        self.get(handle).and_then(|b| b.varname.clone())
    }

    fn maxclass(&self, handle: ObjectId) -> String {
        self.get(handle).map(|b| b.maxclass.clone()).unwrap_or_default()
    }

    fn remove(&mut self, handle: ObjectId) {
        self.boxes.retain(|b| b.id != handle);
        self.cords.retain(|c| c.src != handle && c.dst != handle);
    }

    fn connect(&mut self, src: ObjectId, outlet: u32, dst: ObjectId, inlet: u32) -> bool {
        let outlet_ok = self.get(src).is_some_and(|b| outlet < b.numoutlets);
        let inlet_ok = self.get(dst).is_some_and(|b| inlet < b.numinlets);
        if !outlet_ok || !inlet_ok {
            return false;
        }
        let cord = Cord {
            src,
            outlet,
            dst,
            inlet,
        };
        if !self.cords.contains(&cord) {
            self.cords.push(cord);
        }
        true
    }

    fn disconnect(&mut self, src: ObjectId, outlet: u32, dst: ObjectId, inlet: u32) -> bool {
        let before = self.cords.len();
        self.cords.retain(|c| {
            !(c.src == src && c.outlet == outlet && c.dst == dst && c.inlet == inlet)
        });
        self.cords.len() != before
    }

    fn attr_names(&self, handle: ObjectId) -> Vec<String> {
        let Some(b) = self.get(handle) else {
            return Vec::new();
        };
        let mut names: Vec<String> = b.attrs.keys().cloned().collect();
        names.push("patching_rect".to_string());
        names.sort();
        names
    }

    fn get_attr(&self, handle: ObjectId, name: &str) -> Option<Value> {
        let b = self.get(handle)?;
        if name == "patching_rect" {
            return serde_json::to_value(b.rect).ok();
        }
        b.attrs.get(name).cloned()
    }

    fn set_attr(&mut self, handle: ObjectId, name: &str, value: Value) -> bool {
        let Some(b) = self.get_mut(handle) else {
            return false;
        };
        if name == "patching_rect" {
            return match serde_json::from_value::<Rect>(value) {
                Ok(rect) => {
                    b.rect = rect;
                    true
                }
                Err(_) => false,
            };
        }
        match b.attrs.get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn apply_deep_if(&self, predicate: &mut dyn FnMut(ObjectId) -> bool) -> Vec<ObjectId> {
        self.boxes
            .iter()
            .map(|b| b.id)
            .filter(|id| predicate(*id))
            .collect()
    }

    fn outputs(&self, handle: ObjectId) -> Vec<Outgoing<ObjectId>> {
        self.cords
            .iter()
            .filter(|c| c.src == handle)
            .map(|c| Outgoing {
                outlet: c.outlet,
                dst: c.dst,
                inlet: c.inlet,
            })
            .collect()
    }

    fn num_inlets(&self, handle: ObjectId) -> u32 {
        self.get(handle).map(|b| b.numinlets).unwrap_or(0)
    }

    fn num_outlets(&self, handle: ObjectId) -> u32 {
        self.get(handle).map(|b| b.numoutlets).unwrap_or(0)
    }

    fn rect(&self, handle: ObjectId) -> Rect {
        self.get(handle).map(|b| b.rect).unwrap_or_default()
    }

    fn is_selected(&self, handle: ObjectId) -> bool {
        self.get(handle).is_some_and(|b| b.selected)
    }

    fn box_text(&self, handle: ObjectId) -> Option<String> {
        self.get(handle).and_then(PatcherBox::display_text)
    }

    fn send_message(&mut self, handle: ObjectId, selector: &str, args: &[Atom]) -> bool {
        let Some(b) = self.get_mut(handle) else {
            return false;
        };
        b.received.push(Received {
            selector: selector.to_string(),
            args: args.to_vec(),
        });
        b.apply_message(selector, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_boxes_are_newobj_with_text() {
        let mut p = Patcher::new();
        let osc = p.add_with_args("cycle~", &[Atom::Int(440)], 10.0, 10.0, Some("osc"));
        assert_eq!(p.maxclass(osc), "newobj");
        assert_eq!(p.box_text(osc).as_deref(), Some("cycle~ 440"));
        assert_eq!((p.num_inlets(osc), p.num_outlets(osc)), (2, 1));
        assert_eq!(p.get_named("osc"), Some(osc));
    }

    #[test]
    fn test_connect_checks_port_ranges() {
        let mut p = Patcher::new();
        let osc = p.add("cycle~", 0.0, 0.0, Some("osc"));
        let dac = p.add("dac~", 0.0, 50.0, Some("dac"));
        assert!(p.connect(osc, 0, dac, 1));
        assert!(!p.connect(osc, 1, dac, 0));
        assert!(!p.connect(dac, 0, osc, 0));
        assert_eq!(p.outputs(osc).len(), 1);

        assert!(p.disconnect(osc, 0, dac, 1));
        assert!(!p.disconnect(osc, 0, dac, 1));
        assert!(p.outputs(osc).is_empty());
    }

    #[test]
    fn test_remove_drops_cords() {
        let mut p = Patcher::new();
        let a = p.add("button", 0.0, 0.0, Some("a"));
        let b = p.add("print", 0.0, 40.0, Some("b"));
        p.connect(a, 0, b, 0);
        p.remove(b);
        assert_eq!(p.len(), 1);
        assert_eq!(p.cord_count(), 0);
        assert_eq!(p.get_named("b"), None);
    }

    #[test]
    fn test_set_message_updates_text_and_number() {
        let mut p = Patcher::new();
        let msg = p.add("message", 0.0, 0.0, Some("msg"));
        let num = p.add("flonum", 0.0, 30.0, Some("num"));

        assert!(p.send_message(msg, "set", &[Atom::Symbol("hello".into()), Atom::Int(3)]));
        assert_eq!(p.box_text(msg).as_deref(), Some("hello 3"));

        assert!(p.send_message(num, "set", &[Atom::Float(0.25)]));
        assert_eq!(p.value(num), Some(&Atom::Float(0.25)));
        assert_eq!(p.received(num).len(), 1);
    }

    #[test]
    fn test_attributes_only_settable_when_present() {
        let mut p = Patcher::new();
        let t = p.add("toggle", 5.0, 5.0, Some("t"));
        assert!(p.attr_names(t).contains(&"checkedcolor".to_string()));
        assert!(p.set_attr(t, "fontsize", json!(14.0)));
        assert_eq!(p.get_attr(t, "fontsize"), Some(json!(14.0)));
        assert!(!p.set_attr(t, "nonexistent", json!(1)));

        assert!(p.set_attr(t, "patching_rect", json!([1.0, 2.0, 30.0, 30.0])));
        assert_eq!(p.rect(t), Rect::new(1.0, 2.0, 30.0, 30.0));
        assert!(!p.set_attr(t, "patching_rect", json!("wide")));
    }

    #[test]
    fn test_rejects_blank_class() {
        let mut p = Patcher::new();
        assert!(p.new_default(0.0, 0.0, "", &[]).is_none());
        assert!(p.new_default(0.0, 0.0, "two words", &[]).is_none());
        assert!(p.is_empty());
    }
}
