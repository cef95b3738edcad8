//! Patch service - dispatches commands against the live graph.
//!
//! Owns the graph store outright; the host task is its only caller, so
//! commands apply one at a time in arrival order.

use patchbridge_core::protocol::{
    Action, Atom, Command, CommandError, CommandFailure, MessageBody,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::graph::GraphStore;
use crate::snapshot::{self, Scope, SnapshotOptions};

/// What a dispatched command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Mutation applied (or skipped); nothing to send
    Silent,
    /// Query answered. `has_text` marks results carrying box text or
    /// attribute values, which must reach the caller byte for byte.
    Reply {
        request_id: String,
        results: Value,
        has_text: bool,
    },
    /// Command refused before touching the graph
    Rejected(CommandFailure),
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    pub include_attributes: bool,
    /// Attach box text to snapshots when the store supports it
    pub box_text: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            include_attributes: false,
            box_text: true,
        }
    }
}

/// Command dispatcher bound to one graph.
pub struct PatchService<G: GraphStore> {
    graph: G,
    options: ServiceOptions,
}

impl<G: GraphStore> PatchService<G> {
    pub fn new(graph: G, options: ServiceOptions) -> Self {
        Self { graph, options }
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut G {
        &mut self.graph
    }

    /// Decode and run one raw message.
    pub fn dispatch(&mut self, raw: &str) -> Outcome {
        match Command::parse(raw) {
            Ok(command) => self.execute(command),
            Err(failure) => reject(failure),
        }
    }

    /// Run an already-parsed JSON command object.
    pub fn dispatch_value(&mut self, value: Value) -> Outcome {
        match Command::from_value(value) {
            Ok(command) => self.execute(command),
            Err(failure) => reject(failure),
        }
    }

    /// Run a decoded command.
    pub fn execute(&mut self, command: Command) -> Outcome {
        let Command { request_id, action } = command;
        debug!(action = action.name(), ?request_id, "Dispatching");

        if action.is_query() {
            let Some(request_id) = request_id else {
                return reject(CommandFailure {
                    request_id: None,
                    error: CommandError::MissingField {
                        action: action.name().to_string(),
                        field: "request_id",
                    },
                });
            };
            let (results, has_text) = self.query(action);
            return Outcome::Reply {
                request_id,
                results,
                has_text,
            };
        }

        self.mutate(action);
        Outcome::Silent
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Answer a query; the flag is set when the results carry free text.
    fn query(&mut self, action: Action) -> (Value, bool) {
        match action {
            Action::GetObjectsInPatch {} => self.snapshot(Scope::Patch),
            Action::GetObjectsInSelected {} => self.snapshot(Scope::Selection),
            Action::GetObjectAttributes { varname } => (self.object_attributes(&varname), true),
            Action::GetAvoidRectPosition {} => (
                serde_json::to_value(snapshot::avoid_rect(&self.graph)).unwrap_or(Value::Null),
                false,
            ),
            other => {
                warn!(action = other.name(), "Not a query");
                (Value::Null, false)
            }
        }
    }

    fn snapshot(&mut self, scope: Scope) -> (Value, bool) {
        let options = SnapshotOptions {
            include_attributes: self.options.include_attributes,
        };
        let mut snap = snapshot::snapshot(&mut self.graph, scope, options);
        let with_text = self.options.box_text && self.graph.capabilities().box_text;
        if with_text {
            snapshot::enrich_text(&mut snap, &self.graph);
        }
        let value = serde_json::to_value(&snap).unwrap_or(Value::Null);
        (value, with_text || options.include_attributes)
    }

    /// Attribute map for one box; empty when the box does not exist.
    fn object_attributes(&self, varname: &str) -> Value {
        match self.graph.get_named(varname) {
            Some(handle) => Value::Object(snapshot::attributes(&self.graph, handle)),
            None => {
                warn!(varname, "get_object_attributes: no such object");
                Value::Object(Map::new())
            }
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    fn mutate(&mut self, action: Action) {
        match action {
            Action::AddObject {
                obj_type,
                position,
                varname,
                args,
            } => self.add_object(&obj_type, position, &varname, &args),

            Action::RemoveObject { varname } => {
                if let Some(handle) = self.lookup("remove_object", &varname) {
                    self.graph.remove(handle);
                }
            }

            Action::ConnectObjects {
                src_varname,
                dst_varname,
                outlet_idx,
                inlet_idx,
            } => {
                let (Some(src), Some(dst)) = (
                    self.lookup("connect_objects", &src_varname),
                    self.lookup("connect_objects", &dst_varname),
                ) else {
                    return;
                };
                if !self.graph.connect(src, outlet_idx, dst, inlet_idx) {
                    warn!(
                        src = %src_varname, outlet_idx, dst = %dst_varname, inlet_idx,
                        "connect_objects: port out of range"
                    );
                }
            }

            Action::DisconnectObjects {
                src_varname,
                dst_varname,
                outlet_idx,
                inlet_idx,
            } => {
                let (Some(src), Some(dst)) = (
                    self.lookup("disconnect_objects", &src_varname),
                    self.lookup("disconnect_objects", &dst_varname),
                ) else {
                    return;
                };
                if !self.graph.disconnect(src, outlet_idx, dst, inlet_idx) {
                    debug!(src = %src_varname, dst = %dst_varname, "disconnect_objects: no such line");
                }
            }

            Action::SetObjectAttribute {
                varname,
                attr_name,
                attr_value,
            } => {
                if let Some(handle) = self.lookup("set_object_attribute", &varname) {
                    if !self.graph.set_attr(handle, &attr_name, attr_value) {
                        warn!(varname = %varname, attr_name = %attr_name, "set_object_attribute: attribute not settable");
                    }
                }
            }

            Action::SetMessageText { varname, new_text } => {
                let atoms: Vec<Atom> = new_text.split_whitespace().map(Atom::parse).collect();
                self.deliver("set_message_text", &varname, "set", &atoms);
            }

            Action::SetNumber { varname, num } => {
                self.deliver("set_number", &varname, "set", &[Atom::from(&num)]);
            }

            Action::SendMessageToObject { varname, message } => {
                self.send_message(&varname, message)
            }

            Action::SendBangToObject { varname } => {
                self.deliver("send_bang_to_object", &varname, "bang", &[]);
            }

            query => warn!(action = query.name(), "Query dispatched as mutation"),
        }
    }

    fn add_object(&mut self, obj_type: &str, position: [f64; 2], varname: &str, args: &[Atom]) {
        if self.graph.get_named(varname).is_some() {
            warn!(varname, "add_object: varname already in use");
            return;
        }
        let [x, y] = position;
        match self.graph.new_default(x, y, obj_type, args) {
            Some(handle) => self.graph.set_varname(handle, varname),
            None => warn!(obj_type, varname, "add_object: host refused class"),
        }
    }

    fn send_message(&mut self, varname: &str, message: MessageBody) {
        match message.into_selector() {
            Some((selector, args)) => {
                self.deliver("send_message_to_object", varname, &selector, &args)
            }
            None => warn!(varname, "send_message_to_object: empty message"),
        }
    }

    fn deliver(&mut self, action: &str, varname: &str, selector: &str, args: &[Atom]) {
        if let Some(handle) = self.lookup(action, varname) {
            if !self.graph.send_message(handle, selector, args) {
                debug!(action, varname, selector, "Message ignored by object");
            }
        }
    }

    fn lookup(&self, action: &str, varname: &str) -> Option<G::Handle> {
        let handle = self.graph.get_named(varname);
        if handle.is_none() {
            warn!(action, varname, "No such object");
        }
        handle
    }
}

fn reject(failure: CommandFailure) -> Outcome {
    warn!(request_id = ?failure.request_id, error = %failure.error, "Command rejected");
    Outcome::Rejected(failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Capabilities, Patcher};
    use patchbridge_core::protocol::{codes, Snapshot};
    use serde_json::json;

    fn service() -> PatchService<Patcher> {
        PatchService::new(Patcher::new(), ServiceOptions::default())
    }

    fn send(service: &mut PatchService<Patcher>, value: Value) -> Outcome {
        service.dispatch(&value.to_string())
    }

    fn patch(service: &mut PatchService<Patcher>) -> Snapshot {
        match send(
            service,
            json!({"action": "get_objects_in_patch", "request_id": "snap"}),
        ) {
            Outcome::Reply { results, .. } => serde_json::from_value(results).unwrap(),
            other => panic!("expected reply, got {:?}", other),
        }
    }

    fn build_chain(service: &mut PatchService<Patcher>) {
        for cmd in [
            json!({"action": "add_object", "obj_type": "cycle~", "position": [10, 10], "varname": "osc", "args": [440]}),
            json!({"action": "add_object", "obj_type": "dac~", "position": [10, 80], "varname": "dac"}),
            json!({"action": "connect_objects", "src_varname": "osc", "dst_varname": "dac"}),
            json!({"action": "connect_objects", "src_varname": "osc", "dst_varname": "dac", "inlet_index": 1}),
        ] {
            assert_eq!(send(service, cmd), Outcome::Silent);
        }
    }

    #[test]
    fn test_build_and_snapshot() {
        let mut svc = service();
        build_chain(&mut svc);

        let snap = patch(&mut svc);
        assert_eq!(snap.boxes.len(), 2);
        assert_eq!(snap.lines.len(), 2);
        let osc = snap.node("osc").unwrap();
        assert_eq!(osc.maxclass, "newobj");
        assert_eq!(osc.text.as_deref(), Some("cycle~ 440"));
        assert_eq!(osc.patching_rect.x, 10.0);
    }

    #[test]
    fn test_text_omitted_without_capability() {
        let graph = Patcher::with_capabilities(Capabilities {
            protocol: 1,
            box_text: false,
        });
        let mut svc = PatchService::new(graph, ServiceOptions::default());
        build_chain(&mut svc);
        let snap = patch(&mut svc);
        assert!(snap.nodes().all(|b| b.text.is_none()));
    }

    #[test]
    fn test_remove_missing_is_silent_noop() {
        let mut svc = service();
        build_chain(&mut svc);
        let before = patch(&mut svc);

        let outcome = send(&mut svc, json!({"action": "remove_object", "varname": "ghost"}));
        assert_eq!(outcome, Outcome::Silent);
        assert_eq!(patch(&mut svc), before);
    }

    #[test]
    fn test_mutations_on_missing_object_change_nothing() {
        let mut svc = service();
        build_chain(&mut svc);
        let before = patch(&mut svc);

        let cases = [
            json!({"action": "set_object_attribute", "varname": "ghost", "attr_name": "fontsize", "attr_value": 20}),
            json!({"action": "set_message_text", "varname": "ghost", "new_text": "hello"}),
            json!({"action": "set_number", "varname": "ghost", "num": 3}),
            json!({"action": "send_message_to_object", "varname": "ghost", "message": "set 1"}),
            json!({"action": "send_bang_to_object", "varname": "ghost"}),
            json!({"action": "disconnect_objects", "src_varname": "osc", "dst_varname": "ghost"}),
            json!({"action": "disconnect_objects", "src_varname": "ghost", "dst_varname": "dac"}),
        ];
        for cmd in cases {
            let name = cmd["action"].clone();
            assert_eq!(send(&mut svc, cmd), Outcome::Silent, "{}", name);
            assert_eq!(patch(&mut svc), before, "{}", name);
        }
    }

    #[test]
    fn test_numeric_request_id_is_echoed() {
        let mut svc = service();
        match send(&mut svc, json!({"action": "get_avoid_rect_position", "request_id": 42})) {
            Outcome::Reply { request_id, .. } => assert_eq!(request_id, "42"),
            other => panic!("expected reply, got {:?}", other),
        }
        match send(&mut svc, json!({"action": "warp", "request_id": 43})) {
            Outcome::Rejected(failure) => assert_eq!(failure.request_id.as_deref(), Some("43")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_to_missing_adds_no_line() {
        let mut svc = service();
        send(
            &mut svc,
            json!({"action": "add_object", "obj_type": "button", "position": [0, 0], "varname": "a"}),
        );
        let outcome = send(
            &mut svc,
            json!({"action": "connect_objects", "src_varname": "a", "dst_varname": "b"}),
        );
        assert_eq!(outcome, Outcome::Silent);
        assert!(patch(&mut svc).lines.is_empty());
    }

    #[test]
    fn test_disconnect_and_remove() {
        let mut svc = service();
        build_chain(&mut svc);
        send(
            &mut svc,
            json!({"action": "disconnect_objects", "src_varname": "osc", "dst_varname": "dac", "inlet_idx": 1}),
        );
        assert_eq!(patch(&mut svc).lines.len(), 1);

        send(&mut svc, json!({"action": "remove_object", "varname": "dac"}));
        let snap = patch(&mut svc);
        assert_eq!(snap.boxes.len(), 1);
        assert!(snap.lines.is_empty());
    }

    #[test]
    fn test_duplicate_varname_is_ignored() {
        let mut svc = service();
        build_chain(&mut svc);
        send(
            &mut svc,
            json!({"action": "add_object", "obj_type": "print", "position": [0, 0], "varname": "osc"}),
        );
        assert_eq!(svc.graph().len(), 2);
    }

    #[test]
    fn test_validation_errors_carry_messages() {
        let mut svc = service();

        let cases = [
            (json!({"action": "add_object", "varname": "x"}), "Missing obj_type for add_object"),
            (json!({"action": "warp", "request_id": "r"}), "Unknown action: warp"),
            (json!({"varname": "x"}), "Missing action"),
            (json!({"action": "get_objects_in_patch"}), "Missing request_id for get_objects_in_patch"),
        ];
        for (cmd, message) in cases {
            match send(&mut svc, cmd) {
                Outcome::Rejected(failure) => assert_eq!(failure.error.to_string(), message),
                other => panic!("expected rejection, got {:?}", other),
            }
        }
        assert!(svc.graph().is_empty());

        match svc.dispatch("not json") {
            Outcome::Rejected(failure) => assert_eq!(failure.error.code(), codes::INVALID_PAYLOAD),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_queries_reply_even_when_empty() {
        let mut svc = service();
        assert_eq!(
            send(&mut svc, json!({"action": "get_avoid_rect_position", "request_id": "r1"})),
            Outcome::Reply {
                request_id: "r1".into(),
                results: Value::Null,
                has_text: false,
            }
        );
        assert_eq!(
            send(&mut svc, json!({"action": "get_object_attributes", "request_id": "r2", "varname": "none"})),
            Outcome::Reply {
                request_id: "r2".into(),
                results: json!({}),
                has_text: true,
            }
        );
        assert_eq!(
            send(&mut svc, json!({"action": "get_objects_in_selected", "request_id": "r3"})),
            Outcome::Reply {
                request_id: "r3".into(),
                results: json!({"boxes": [], "lines": []}),
                has_text: true,
            }
        );
    }

    #[test]
    fn test_avoid_rect_reply() {
        let mut svc = service();
        send(
            &mut svc,
            json!({"action": "add_object", "obj_type": "toggle", "position": [100, 40], "varname": "t"}),
        );
        match send(&mut svc, json!({"action": "get_avoid_rect_position", "request_id": "r"})) {
            Outcome::Reply { results, .. } => assert_eq!(results, json!([100.0, 40.0, 124.0, 64.0])),
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_attribute_roundtrip() {
        let mut svc = service();
        build_chain(&mut svc);
        send(
            &mut svc,
            json!({"action": "set_object_attribute", "varname": "osc", "attr_name": "fontsize", "attr_value": 16}),
        );
        send(
            &mut svc,
            json!({"action": "set_object_attribute", "varname": "osc", "attr_name": "bogus", "attr_value": 1}),
        );
        match send(
            &mut svc,
            json!({"action": "get_object_attributes", "request_id": "a", "varname": "osc"}),
        ) {
            Outcome::Reply { results, .. } => {
                assert_eq!(results["fontsize"], json!(16));
                assert!(results.get("bogus").is_none());
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_text_number_and_messages() {
        let mut svc = service();
        for cmd in [
            json!({"action": "add_object", "obj_type": "message", "position": [0, 0], "varname": "msg"}),
            json!({"action": "add_object", "obj_type": "number", "position": [0, 40], "varname": "num"}),
            json!({"action": "add_object", "obj_type": "toggle", "position": [0, 80], "varname": "tog"}),
            json!({"action": "set_message_text", "varname": "msg", "new_text": "freq 220"}),
            json!({"action": "set_number", "varname": "num", "num": 7.9}),
            json!({"action": "send_bang_to_object", "varname": "tog"}),
            json!({"action": "send_message_to_object", "varname": "msg", "message": "bang"}),
            json!({"action": "send_message_to_object", "varname": "num", "message": [1, 2]}),
        ] {
            assert_eq!(send(&mut svc, cmd), Outcome::Silent);
        }

        let snap = patch(&mut svc);
        assert_eq!(snap.node("msg").unwrap().text.as_deref(), Some("freq 220"));
        assert_eq!(snap.node("num").unwrap().text.as_deref(), Some("7"));

        let graph = svc.graph();
        let tog = graph.get_named("tog").unwrap();
        assert_eq!(graph.value(tog), Some(&Atom::Int(1)));
        let num = graph.get_named("num").unwrap();
        assert_eq!(graph.received(num).last().unwrap().selector, "list");
    }
}
