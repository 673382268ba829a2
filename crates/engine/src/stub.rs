//! A miniature in-process document engine. It models just enough editing
//! behaviour (selection, paste, deletion, tile revisions) for the worker
//! and the test-suite to drive every code path the real engine would.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use docbridge_protocol::TileRequest;

use crate::{
    CallbackEvent, CallbackFn, DocType, DocumentStatus, Engine, EngineDocument, EngineError,
};

const PAGE_WIDTH: i64 = 12240;
const LINE_HEIGHT: i64 = 400;
const WHITESPACE_MARGIN: i64 = 24000;
const COMPACT_MARGIN: i64 = 1440;

pub struct StubEngine;

impl StubEngine {
    pub fn new() -> Self {
        StubEngine
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        StubEngine::new()
    }
}

impl Engine for StubEngine {
    fn load_document(
        &self,
        uri: &str,
        options: Option<&str>,
    ) -> Result<Arc<dyn EngineDocument>, EngineError> {
        Ok(Arc::new(StubDocument::open(uri, options)?))
    }
}

struct DocState {
    uri: String,
    content: String,
    selected: bool,
    doc_type: DocType,
    parts: i32,
    current_part: i32,
    hide_whitespace: bool,
    modified: bool,
    revision: u64,
    next_view: i32,
    views: Vec<i32>,
}

#[derive(Default)]
struct Callbacks {
    document: Option<CallbackFn>,
    views: HashMap<i32, CallbackFn>,
}

pub struct StubDocument {
    state: Mutex<DocState>,
    callbacks: Mutex<Callbacks>,
}

impl StubDocument {
    fn open(uri: &str, options: Option<&str>) -> Result<Self, EngineError> {
        let path = file_uri_path(uri);
        let content = match &path {
            Some(path) if path.exists() => std::fs::read_to_string(path)
                .unwrap_or_else(|_| String::from_utf8_lossy(&std::fs::read(path).unwrap_or_default()).into_owned()),
            Some(_) => return Err(EngineError::Load(format!("no such document: {}", uri))),
            None => return Err(EngineError::Load(format!("unsupported uri: {}", uri))),
        };

        let doc_type = doc_type_for(path.as_deref().unwrap_or_else(|| Path::new("")));
        let parts = match doc_type {
            DocType::Text => 1,
            DocType::Spreadsheet => 3,
            DocType::Presentation => 2,
            _ => 1,
        };

        let hide_whitespace = options
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|json| {
                json.pointer("/rendering/.uno:HideWhitespace/value")
                    .and_then(|value| value.as_str().map(str::to_string))
            })
            .map(|value| value == "true")
            .unwrap_or(false);

        Ok(StubDocument {
            state: Mutex::new(DocState {
                uri: uri.to_string(),
                content,
                selected: false,
                doc_type,
                parts,
                current_part: 0,
                hide_whitespace,
                modified: false,
                revision: 0,
                next_view: 0,
                views: Vec::new(),
            }),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    fn emit(&self, events: Vec<CallbackEvent>) {
        let callbacks = self.callbacks.lock().unwrap();
        for event in &events {
            if let Some(callback) = &callbacks.document {
                callback(event);
            }
        }
    }

    fn emit_to_view(&self, view_id: i32, event: CallbackEvent) {
        let callbacks = self.callbacks.lock().unwrap();
        if let Some(callback) = callbacks.views.get(&view_id) {
            callback(&event);
        }
    }

    /// Records an edit: bumps the tile revision and collects the
    /// invalidations the engine would raise for it.
    fn touch(state: &mut DocState, events: &mut Vec<CallbackEvent>) {
        state.modified = true;
        state.revision += 1;
        events.push(CallbackEvent::InvalidateTiles {
            part: state.current_part,
            x: 0,
            y: 0,
            width: i32::MAX,
            height: i32::MAX,
        });
        events.push(CallbackEvent::InvalidateCursor {
            rect: "0, 0, 0, 0".to_string(),
        });
    }
}

impl EngineDocument for StubDocument {
    fn status(&self) -> DocumentStatus {
        let state = self.state.lock().unwrap();
        let lines = state.content.lines().count().max(1) as i64;
        let margin = if state.hide_whitespace {
            COMPACT_MARGIN
        } else {
            WHITESPACE_MARGIN
        };
        DocumentStatus {
            doc_type: state.doc_type,
            parts: state.parts,
            current_part: state.current_part,
            width: PAGE_WIDTH,
            height: margin + lines * LINE_HEIGHT,
        }
    }

    fn set_part(&self, part: i32) {
        let mut state = self.state.lock().unwrap();
        if part >= 0 && part < state.parts {
            state.current_part = part;
        }
    }

    fn create_view(&self, callback: CallbackFn) -> i32 {
        let view_id = {
            let mut state = self.state.lock().unwrap();
            let view_id = state.next_view;
            state.next_view += 1;
            state.views.push(view_id);
            view_id
        };
        // wire the callback before announcing anything, so the view's
        // initial paint request is actually delivered
        self.callbacks.lock().unwrap().views.insert(view_id, callback);
        self.emit_to_view(
            view_id,
            CallbackEvent::InvalidateTiles {
                part: 0,
                x: 0,
                y: 0,
                width: i32::MAX,
                height: i32::MAX,
            },
        );
        view_id
    }

    fn destroy_view(&self, view_id: i32) {
        self.state.lock().unwrap().views.retain(|&id| id != view_id);
        self.callbacks.lock().unwrap().views.remove(&view_id);
    }

    fn register_callback(&self, callback: CallbackFn) {
        self.callbacks.lock().unwrap().document = Some(callback);
    }

    fn render_tile(&self, tile: &TileRequest) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        // PNG signature followed by bytes derived from the content
        // revision and the tile key, so edits change the rendering.
        let mut out = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let mut mix = |value: i64| {
            hash ^= value as u64;
            hash = hash.wrapping_mul(0x100_0000_01b3);
        };
        mix(state.revision as i64);
        mix(tile.part as i64);
        mix(tile.width as i64);
        mix(tile.height as i64);
        mix(tile.tile_pos_x as i64);
        mix(tile.tile_pos_y as i64);
        mix(tile.tile_width as i64);
        mix(tile.tile_height as i64);
        for chunk in 0..8u64 {
            out.extend_from_slice(&(hash ^ chunk.wrapping_mul(0x9e37_79b9)).to_be_bytes());
        }
        out
    }

    fn render_font(&self, font: &str) -> Vec<u8> {
        let mut out = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
        out.extend_from_slice(font.as_bytes());
        out
    }

    fn part_page_rectangles(&self) -> String {
        let status = self.status();
        format!(
            "partpagerectangles: 0, 0, {}, {}",
            status.width, status.height
        )
    }

    fn key_event(&self, event_type: &str, char_code: i32, _key_code: i32) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if event_type == "input" {
                if let Some(ch) = char::from_u32(char_code as u32).filter(|ch| *ch != '\0') {
                    state.content.push(ch);
                }
                Self::touch(&mut state, &mut events);
            }
        }
        self.emit(events);
    }

    fn mouse_event(&self, event_type: &str, _x: i32, _y: i32, _count: i32) {
        if event_type == "buttondown" {
            self.emit(vec![CallbackEvent::InvalidateCursor {
                rect: "0, 0, 0, 0".to_string(),
            }]);
        }
    }

    fn select_text(&self, select_type: &str, _x: i32, _y: i32) {
        let mut state = self.state.lock().unwrap();
        state.selected = select_type != "reset";
    }

    fn select_graphic(&self, _select_type: &str, _x: i32, _y: i32) {}

    fn reset_selection(&self) {
        self.state.lock().unwrap().selected = false;
    }

    fn uno_command(&self, command: &str) -> bool {
        let mut events = Vec::new();
        let handled = {
            let mut state = self.state.lock().unwrap();
            match command {
                ".uno:SelectAll" => {
                    state.selected = true;
                    true
                }
                ".uno:Delete" => {
                    if state.selected {
                        state.content.clear();
                        state.selected = false;
                        Self::touch(&mut state, &mut events);
                    }
                    true
                }
                ".uno:Save" => {
                    // handled by save(); accepted here so generic uno
                    // dispatch does not reject it
                    true
                }
                _ if command.starts_with(".uno:") => {
                    Self::touch(&mut state, &mut events);
                    true
                }
                _ => false,
            }
        };
        self.emit(events);
        handled
    }

    fn paste(&self, _mimetype: &str, data: &[u8]) -> bool {
        let text = String::from_utf8_lossy(data).into_owned();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.selected {
                state.content = text;
                state.selected = false;
            } else {
                state.content.push_str(&text);
            }
            Self::touch(&mut state, &mut events);
        }
        self.emit(events);
        true
    }

    fn text_selection(&self, _mimetype: &str) -> String {
        let state = self.state.lock().unwrap();
        if state.selected {
            state.content.clone()
        } else {
            String::new()
        }
    }

    fn save(&self) -> bool {
        let mut events = Vec::new();
        let saved = {
            let mut state = self.state.lock().unwrap();
            let saved = match file_uri_path(&state.uri) {
                Some(path) => std::fs::write(path, state.content.as_bytes()).is_ok(),
                None => false,
            };
            if saved {
                state.modified = false;
                events.push(CallbackEvent::StateChanged {
                    state: ".uno:ModifiedStatus=false".to_string(),
                });
            }
            saved
        };
        self.emit(events);
        saved
    }

    fn save_as(&self, url: &str, _format: Option<&str>, _options: Option<&str>) -> bool {
        let state = self.state.lock().unwrap();
        match file_uri_path(url) {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                std::fs::write(path, state.content.as_bytes()).is_ok()
            }
            None => false,
        }
    }

    fn is_modified(&self) -> bool {
        self.state.lock().unwrap().modified
    }
}

fn file_uri_path(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

fn doc_type_for(path: &std::path::Path) -> DocType {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("odt") | Some("doc") | Some("docx") | Some("txt") => DocType::Text,
        Some("ods") | Some("xls") | Some("xlsx") => DocType::Spreadsheet,
        Some("odp") | Some("ppt") | Some("pptx") => DocType::Presentation,
        Some("odg") => DocType::Drawing,
        _ => DocType::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn open_doc(content: &str, options: Option<&str>) -> (tempfile::TempDir, Arc<dyn EngineDocument>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.odt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let uri = format!("file://{}", path.display());
        let doc = StubEngine::new().load_document(&uri, options).unwrap();
        (dir, doc)
    }

    #[test]
    fn paste_replaces_selection() {
        let (_dir, doc) = open_doc("Hello world", None);
        assert!(doc.uno_command(".uno:SelectAll"));
        assert!(doc.uno_command(".uno:Delete"));
        assert!(doc.paste("text/plain;charset=utf-8", b"aaa bbb ccc"));
        assert!(doc.uno_command(".uno:SelectAll"));
        assert_eq!(doc.text_selection("text/plain;charset=utf-8"), "aaa bbb ccc");
        assert!(doc.is_modified());
    }

    #[test]
    fn selection_is_empty_without_select_all() {
        let (_dir, doc) = open_doc("Hello", None);
        assert_eq!(doc.text_selection("text/plain"), "");
    }

    #[test]
    fn edits_change_tile_bytes() {
        let (_dir, doc) = open_doc("Hello", None);
        let tile = TileRequest {
            part: 0,
            width: 256,
            height: 256,
            tile_pos_x: 0,
            tile_pos_y: 0,
            tile_width: 3840,
            tile_height: 3840,
        };
        let before = doc.render_tile(&tile);
        assert!(before.starts_with(&[0x89, b'P', b'N', b'G']));
        doc.paste("text/plain", b"edit");
        let after = doc.render_tile(&tile);
        assert_ne!(before, after);
        // unchanged revision renders identically
        assert_eq!(after, doc.render_tile(&tile));
    }

    #[test]
    fn hide_whitespace_shrinks_status_height() {
        let options = r#"{"rendering":{".uno:HideWhitespace":{"type":"boolean","value":"true"}}}"#;
        let (_dir, plain) = open_doc("line one\nline two", None);
        let (_dir2, compact) = open_doc("line one\nline two", Some(options));
        assert!(plain.status().height >= 20000);
        assert!(compact.status().height < 20000);
    }

    #[test]
    fn callbacks_fire_on_edit() {
        let (_dir, doc) = open_doc("Hello", None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        doc.register_callback(Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));
        doc.paste("text/plain", b"x");
        let events = seen.lock().unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event, CallbackEvent::InvalidateTiles { .. })));
    }

    #[test]
    fn new_view_receives_initial_invalidation() {
        let (_dir, doc) = open_doc("Hello", None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let view_id = doc.create_view(Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, CallbackEvent::InvalidateTiles { .. })));
        doc.destroy_view(view_id);
    }

    #[test]
    fn save_clears_modified_and_writes_back() {
        let (dir, doc) = open_doc("old", None);
        doc.uno_command(".uno:SelectAll");
        doc.uno_command(".uno:Delete");
        doc.paste("text/plain", b"new");
        assert!(doc.is_modified());
        assert!(doc.save());
        assert!(!doc.is_modified());
        let written = std::fs::read_to_string(dir.path().join("hello.odt")).unwrap();
        assert_eq!(written, "new");
    }

    #[test]
    fn missing_document_fails_to_load() {
        let err = StubEngine::new()
            .load_document("file:///nonexistent/y.odt", None)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Load(_)));
    }
}
