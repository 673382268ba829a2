use thiserror::Error;

use crate::error::ErrorKind;
use crate::tokens::{token_string, Tokens};

/// Every command a client may send after the version handshake. Anything
/// else is answered with `kind=unknown`.
pub const CLIENT_COMMANDS: &[&str] = &[
    "canceltiles",
    "clientvisiblearea",
    "clientzoom",
    "commandvalues",
    "disconnect",
    "downloadas",
    "getchildid",
    "gettextselection",
    "insertfile",
    "invalidatetiles",
    "key",
    "load",
    "mouse",
    "partpagerectangles",
    "paste",
    "renderfont",
    "requestloksession",
    "resetselection",
    "saveas",
    "selectgraphic",
    "selecttext",
    "setclientpart",
    "setpage",
    "status",
    "tile",
    "tilecombine",
    "unload",
    "uno",
];

pub fn is_client_command(name: &str) -> bool {
    CLIENT_COMMANDS.binary_search(&name).is_ok()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("malformed {0} command")]
    Syntax(&'static str),
    #[error("{0} parameters out of range")]
    Invalid(&'static str),
}

impl CommandError {
    pub fn cmd(&self) -> &'static str {
        match self {
            CommandError::Syntax(cmd) | CommandError::Invalid(cmd) => cmd,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Syntax(_) => ErrorKind::Syntax,
            CommandError::Invalid(_) => ErrorKind::Invalid,
        }
    }
}

/// A single tile: the seven-field key shared by the `tile` command, the
/// `tile:` response header and the cache. Equality is exact on all seven
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRequest {
    pub part: i32,
    pub width: i32,
    pub height: i32,
    pub tile_pos_x: i32,
    pub tile_pos_y: i32,
    pub tile_width: i32,
    pub tile_height: i32,
}

impl TileRequest {
    /// Parses the fields following the command name. Works for both the
    /// `tile` request and the `tile:` response header, which share the
    /// layout.
    pub fn parse(tokens: &Tokens) -> Result<Self, CommandError> {
        if tokens.count() < 8 {
            return Err(CommandError::Syntax("tile"));
        }
        let tile = TileRequest {
            part: tokens.int(1, "part").ok_or(CommandError::Syntax("tile"))?,
            width: tokens.int(2, "width").ok_or(CommandError::Syntax("tile"))?,
            height: tokens.int(3, "height").ok_or(CommandError::Syntax("tile"))?,
            tile_pos_x: tokens
                .int(4, "tileposx")
                .ok_or(CommandError::Syntax("tile"))?,
            tile_pos_y: tokens
                .int(5, "tileposy")
                .ok_or(CommandError::Syntax("tile"))?,
            tile_width: tokens
                .int(6, "tilewidth")
                .ok_or(CommandError::Syntax("tile"))?,
            tile_height: tokens
                .int(7, "tileheight")
                .ok_or(CommandError::Syntax("tile"))?,
        };
        tile.validate()?;
        Ok(tile)
    }

    fn validate(&self) -> Result<(), CommandError> {
        if self.part < 0
            || self.width <= 0
            || self.height <= 0
            || self.tile_pos_x < 0
            || self.tile_pos_y < 0
            || self.tile_width <= 0
            || self.tile_height <= 0
        {
            return Err(CommandError::Invalid("tile"));
        }
        Ok(())
    }

    fn fields(&self) -> String {
        format!(
            "part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={}",
            self.part,
            self.width,
            self.height,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height
        )
    }

    pub fn to_command(&self) -> String {
        format!("tile {}", self.fields())
    }

    /// Header line of the binary response frame, newline terminated; the
    /// PNG bytes follow directly.
    pub fn response_header(&self) -> String {
        format!("tile: {}\n", self.fields())
    }
}

/// The `tilecombine` command: one request covering several tile positions
/// at a shared size. The X and Y position lists must be the same length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCombineRequest {
    pub part: i32,
    pub width: i32,
    pub height: i32,
    pub positions_x: Vec<i32>,
    pub positions_y: Vec<i32>,
    pub tile_width: i32,
    pub tile_height: i32,
}

impl TileCombineRequest {
    pub fn parse(tokens: &Tokens) -> Result<Self, CommandError> {
        if tokens.count() < 8 {
            return Err(CommandError::Syntax("tilecombine"));
        }
        let part = tokens
            .int(1, "part")
            .ok_or(CommandError::Syntax("tilecombine"))?;
        let width = tokens
            .int(2, "width")
            .ok_or(CommandError::Syntax("tilecombine"))?;
        let height = tokens
            .int(3, "height")
            .ok_or(CommandError::Syntax("tilecombine"))?;
        let pos_x = tokens
            .string(4, "tileposx")
            .ok_or(CommandError::Syntax("tilecombine"))?;
        let pos_y = tokens
            .string(5, "tileposy")
            .ok_or(CommandError::Syntax("tilecombine"))?;
        let tile_width = tokens
            .int(6, "tilewidth")
            .ok_or(CommandError::Syntax("tilecombine"))?;
        let tile_height = tokens
            .int(7, "tileheight")
            .ok_or(CommandError::Syntax("tilecombine"))?;

        if part < 0
            || width <= 0
            || height <= 0
            || tile_width <= 0
            || tile_height <= 0
            || pos_x.is_empty()
            || pos_y.is_empty()
        {
            return Err(CommandError::Invalid("tilecombine"));
        }

        let positions_x = parse_positions(pos_x)?;
        let positions_y = parse_positions(pos_y)?;
        if positions_x.len() != positions_y.len() {
            return Err(CommandError::Invalid("tilecombine"));
        }

        Ok(TileCombineRequest {
            part,
            width,
            height,
            positions_x,
            positions_y,
            tile_width,
            tile_height,
        })
    }

    /// Rebuilds a `tilecombine` command for a subset of positions, used
    /// when forwarding only the cache misses.
    pub fn with_positions(&self, positions: &[(i32, i32)]) -> Self {
        TileCombineRequest {
            part: self.part,
            width: self.width,
            height: self.height,
            positions_x: positions.iter().map(|&(x, _)| x).collect(),
            positions_y: positions.iter().map(|&(_, y)| y).collect(),
            tile_width: self.tile_width,
            tile_height: self.tile_height,
        }
    }

    pub fn tiles(&self) -> impl Iterator<Item = TileRequest> + '_ {
        self.positions_x
            .iter()
            .zip(&self.positions_y)
            .map(|(&x, &y)| TileRequest {
                part: self.part,
                width: self.width,
                height: self.height,
                tile_pos_x: x,
                tile_pos_y: y,
                tile_width: self.tile_width,
                tile_height: self.tile_height,
            })
    }

    pub fn to_command(&self) -> String {
        let join = |positions: &[i32]| {
            positions
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            "tilecombine part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={}",
            self.part,
            self.width,
            self.height,
            join(&self.positions_x),
            join(&self.positions_y),
            self.tile_width,
            self.tile_height
        )
    }
}

fn parse_positions(list: &str) -> Result<Vec<i32>, CommandError> {
    list.split(',')
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.trim()
                .parse()
                .map_err(|_| CommandError::Syntax("tilecombine"))
        })
        .collect()
}

/// The `load` command. `options` keeps its raw JSON text; it may contain
/// spaces, so it swallows the rest of the line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadCommand {
    pub url: String,
    pub jail: Option<String>,
    pub part: Option<i32>,
    pub timestamp: Option<String>,
    pub options: Option<String>,
}

impl LoadCommand {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let tokens = Tokens::parse(line);
        if tokens.count() < 2 {
            return Err(CommandError::Syntax("load"));
        }

        let mut load = LoadCommand::default();
        for token in tokens.iter().skip(1) {
            if let Some(url) = token_string(token, "url") {
                load.url = url.to_string();
            } else if let Some(jail) = token_string(token, "jail") {
                load.jail = Some(jail.to_string());
            } else if let Some(part) = token_string(token, "part") {
                load.part = part.parse().ok();
            } else if let Some(timestamp) = token_string(token, "timestamp") {
                load.timestamp = Some(timestamp.to_string());
            } else if token.starts_with("options=") {
                break;
            }
        }

        // The options value is JSON and may contain spaces, so it is cut
        // from the raw line rather than from the token list.
        if let Some(pos) = line.find("options=") {
            let value = &line[pos + "options=".len()..];
            if !value.is_empty() {
                load.options = Some(value.to_string());
            }
        }

        if load.url.is_empty() {
            return Err(CommandError::Syntax("load"));
        }
        Ok(load)
    }

    pub fn to_command(&self) -> String {
        let mut out = format!("load url={}", self.url);
        if let Some(jail) = &self.jail {
            out.push_str(&format!(" jail={}", jail));
        }
        if let Some(part) = self.part {
            out.push_str(&format!(" part={}", part));
        }
        if let Some(timestamp) = &self.timestamp {
            out.push_str(&format!(" timestamp={}", timestamp));
        }
        if let Some(options) = &self.options {
            out.push_str(&format!(" options={}", options));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_table_is_sorted() {
        let mut sorted = CLIENT_COMMANDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, CLIENT_COMMANDS);
    }

    #[test]
    fn known_and_unknown_commands() {
        assert!(is_client_command("tile"));
        assert!(is_client_command("uno"));
        assert!(!is_client_command("bogus"));
        assert!(!is_client_command("loolclient"));
    }

    #[test]
    fn tile_parse_and_format_round_trip() {
        let tokens = Tokens::parse(
            "tile part=0 width=256 height=256 tileposx=3840 tileposy=0 tilewidth=3840 tileheight=3840",
        );
        let tile = TileRequest::parse(&tokens).unwrap();
        assert_eq!(tile.part, 0);
        assert_eq!(tile.tile_pos_x, 3840);
        let reparsed = TileRequest::parse(&Tokens::parse(&tile.to_command())).unwrap();
        assert_eq!(tile, reparsed);
    }

    #[test]
    fn tile_response_header_is_parseable() {
        let tile = TileRequest {
            part: 1,
            width: 256,
            height: 256,
            tile_pos_x: 0,
            tile_pos_y: 3840,
            tile_width: 3840,
            tile_height: 3840,
        };
        let header = tile.response_header();
        assert!(header.starts_with("tile: part=1 "));
        assert!(header.ends_with('\n'));
        let reparsed = TileRequest::parse(&Tokens::parse(header.trim_end())).unwrap();
        assert_eq!(tile, reparsed);
    }

    #[test]
    fn tile_rejects_bad_input() {
        let missing = Tokens::parse("tile part=0 width=256");
        assert_eq!(TileRequest::parse(&missing), Err(CommandError::Syntax("tile")));

        let negative = Tokens::parse(
            "tile part=-1 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840",
        );
        assert_eq!(TileRequest::parse(&negative), Err(CommandError::Invalid("tile")));
    }

    #[test]
    fn tilecombine_parses_position_lists() {
        let tokens = Tokens::parse(
            "tilecombine part=0 width=256 height=256 tileposx=0,3840,7680 tileposy=0,0,0 tilewidth=3840 tileheight=3840",
        );
        let combined = TileCombineRequest::parse(&tokens).unwrap();
        assert_eq!(combined.positions_x, vec![0, 3840, 7680]);
        let tiles: Vec<_> = combined.tiles().collect();
        assert_eq!(tiles.len(), 3);
        assert_eq!(tiles[1].tile_pos_x, 3840);
        assert_eq!(tiles[1].tile_pos_y, 0);
    }

    #[test]
    fn tilecombine_rejects_mismatched_position_lists() {
        let tokens = Tokens::parse(
            "tilecombine part=0 width=256 height=256 tileposx=0,3840 tileposy=0 tilewidth=3840 tileheight=3840",
        );
        assert_eq!(
            TileCombineRequest::parse(&tokens),
            Err(CommandError::Invalid("tilecombine"))
        );
    }

    #[test]
    fn tilecombine_subset_round_trip() {
        let tokens = Tokens::parse(
            "tilecombine part=0 width=256 height=256 tileposx=0,3840 tileposy=0,0 tilewidth=3840 tileheight=3840",
        );
        let combined = TileCombineRequest::parse(&tokens).unwrap();
        let subset = combined.with_positions(&[(3840, 0)]);
        let reparsed = TileCombineRequest::parse(&Tokens::parse(&subset.to_command())).unwrap();
        assert_eq!(reparsed.positions_x, vec![3840]);
        assert_eq!(reparsed.positions_y, vec![0]);
    }

    #[test]
    fn load_parses_optional_fields() {
        let load = LoadCommand::parse("load url=file:///tmp/hello.odt").unwrap();
        assert_eq!(load.url, "file:///tmp/hello.odt");
        assert_eq!(load.part, None);

        let load = LoadCommand::parse(
            r#"load part=2 url=file:///tmp/a.odt timestamp=1234 options={"rendering":{".uno:HideWhitespace":{"type":"boolean","value":"true"}}}"#,
        )
        .unwrap();
        assert_eq!(load.part, Some(2));
        assert_eq!(load.timestamp.as_deref(), Some("1234"));
        assert!(load.options.as_deref().unwrap().contains("HideWhitespace"));
    }

    #[test]
    fn load_options_survive_spaces() {
        let load =
            LoadCommand::parse(r#"load url=file:///a.odt options={"author": "A B"}"#).unwrap();
        assert_eq!(load.options.as_deref(), Some(r#"{"author": "A B"}"#));
        let reparsed = LoadCommand::parse(&load.to_command()).unwrap();
        assert_eq!(load, reparsed);
    }

    #[test]
    fn load_without_url_is_syntax_error() {
        assert_eq!(
            LoadCommand::parse("load part=0"),
            Err(CommandError::Syntax("load"))
        );
        assert_eq!(LoadCommand::parse("load"), Err(CommandError::Syntax("load")));
    }
}
