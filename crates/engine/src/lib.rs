//! The seam to the native office-document engine. The engine itself is an
//! external collaborator; this crate defines the primitives the worker
//! drives it through (document load, view management, tile render,
//! callback registration) and ships a self-contained stub used by tests
//! and development builds.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use docbridge_protocol::TileRequest;

pub mod stub;

pub use stub::StubEngine;

/// Callback sink registered with the engine. Invoked synchronously from
/// whatever thread drives the engine; implementations must only hand the
/// event off (send on a channel), never call back into the engine.
pub type CallbackFn = Box<dyn Fn(&CallbackEvent) + Send + Sync>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine initialisation failed: {0}")]
    Init(String),
    #[error("failed to load document: {0}")]
    Load(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocType {
    Text,
    Spreadsheet,
    Presentation,
    Drawing,
    Other,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Text => "text",
            DocType::Spreadsheet => "spreadsheet",
            DocType::Presentation => "presentation",
            DocType::Drawing => "drawing",
            DocType::Other => "other",
        }
    }
}

/// Engine-initiated notifications. The worker fans these out to the
/// sessions of the affected document.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    /// A rectangular region's cached renderings are stale. A width or
    /// height of `i32::MAX` means "to the end of the part".
    InvalidateTiles {
        part: i32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    InvalidateCursor {
        rect: String,
    },
    TextSelection {
        rects: String,
    },
    GraphicSelection {
        rect: String,
    },
    CursorVisible {
        visible: bool,
    },
    StateChanged {
        state: String,
    },
    DocumentSizeChanged {
        width: i64,
        height: i64,
    },
    SetPart {
        part: i32,
    },
    SearchNotFound {
        phrase: String,
    },
}

impl CallbackEvent {
    /// The text frame relayed to clients for this event.
    pub fn to_frame(&self) -> String {
        match self {
            CallbackEvent::InvalidateTiles {
                part,
                x,
                y,
                width,
                height,
            } => format!(
                "invalidatetiles: part={} x={} y={} width={} height={}",
                part, x, y, width, height
            ),
            CallbackEvent::InvalidateCursor { rect } => {
                format!("invalidatecursor: {}", rect)
            }
            CallbackEvent::TextSelection { rects } => format!("textselection: {}", rects),
            CallbackEvent::GraphicSelection { rect } => format!("graphicselection: {}", rect),
            CallbackEvent::CursorVisible { visible } => {
                format!("cursorvisible: {}", visible)
            }
            CallbackEvent::StateChanged { state } => format!("statechanged: {}", state),
            CallbackEvent::DocumentSizeChanged { width, height } => {
                format!("documentsizechanged: width={} height={}", width, height)
            }
            CallbackEvent::SetPart { part } => format!("setpart: part={}", part),
            CallbackEvent::SearchNotFound { phrase } => format!("searchnotfound: {}", phrase),
        }
    }
}

/// The `status:` line describing a loaded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentStatus {
    pub doc_type: DocType,
    pub parts: i32,
    pub current_part: i32,
    pub width: i64,
    pub height: i64,
}

impl DocumentStatus {
    pub fn to_frame(&self) -> String {
        format!(
            "status: type={} parts={} current={} width={} height={}",
            self.doc_type.as_str(),
            self.parts,
            self.current_part,
            self.width,
            self.height
        )
    }
}

/// A loaded document. Internally synchronised; the worker nevertheless
/// serialises all calls through one consumer per document.
pub trait EngineDocument: Send + Sync {
    fn status(&self) -> DocumentStatus;
    fn set_part(&self, part: i32);

    /// Creates an additional view of the document. The callback is
    /// wired before the view can raise events, so the view's initial
    /// full-page invalidation is never lost.
    fn create_view(&self, callback: CallbackFn) -> i32;
    fn destroy_view(&self, view_id: i32);
    fn register_callback(&self, callback: CallbackFn);

    fn render_tile(&self, tile: &TileRequest) -> Vec<u8>;
    fn render_font(&self, font: &str) -> Vec<u8>;
    fn part_page_rectangles(&self) -> String;

    fn key_event(&self, event_type: &str, char_code: i32, key_code: i32);
    fn mouse_event(&self, event_type: &str, x: i32, y: i32, count: i32);
    fn select_text(&self, select_type: &str, x: i32, y: i32);
    fn select_graphic(&self, select_type: &str, x: i32, y: i32);
    fn reset_selection(&self);

    /// Dispatches a `.uno:` command. Returns false for commands the
    /// engine does not recognise.
    fn uno_command(&self, command: &str) -> bool;
    fn paste(&self, mimetype: &str, data: &[u8]) -> bool;
    fn text_selection(&self, mimetype: &str) -> String;

    /// Writes the document back to its originating URI.
    fn save(&self) -> bool;
    fn save_as(&self, url: &str, format: Option<&str>, options: Option<&str>) -> bool;
    fn is_modified(&self) -> bool;
}

pub trait Engine: Send + Sync {
    fn load_document(
        &self,
        uri: &str,
        options: Option<&str>,
    ) -> Result<Arc<dyn EngineDocument>, EngineError>;
}

/// Initialises the engine from its install directory and a user-profile
/// URI. The install directory must exist; inside the jail it is the
/// hard-linked engine tree.
pub fn init(install_path: &Path, user_profile_uri: &str) -> Result<Arc<dyn Engine>, EngineError> {
    if !install_path.exists() {
        return Err(EngineError::Init(format!(
            "install path {} does not exist",
            install_path.display()
        )));
    }
    tracing::info!(
        install = %install_path.display(),
        profile = user_profile_uri,
        "engine initialised"
    );
    Ok(Arc::new(StubEngine::new()))
}
