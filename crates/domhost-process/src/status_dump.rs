//! Model and parser for the per-game turn-status artifact.
//!
//! Layout of the artifact:
//!
//! ```text
//! Status for 'game name'
//! turn 5, era 2, mods 3, turnlimit 50
//! Nation	5	56	1	5	2	early_ulm	Ulm	Enigma of Steel
//! ...
//! ```
//!
//! The first line is a banner, the second carries the turn info and every
//! following non-blank line describes one nation.

/// Turn number reported while a game is still in its lobby.
pub const LOBBY_TURN: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("status dump is missing its turn info line")]
    MissingTurnLine,
    #[error("turn info line has no turn number: {0}")]
    MissingTurn(String),
    #[error("invalid value for {key} in turn info line: {value}")]
    InvalidTurnValue { key: &'static str, value: String },
    #[error("nation line does not start with `Nation`: {0}")]
    NotANationLine(String),
    #[error("nation line must carry exactly 5 numbers, found {found}: {line}")]
    WrongNumberCount { found: usize, line: String },
    #[error("nation line is missing its file name or nation name: {0}")]
    MissingNames(String),
    #[error("difficulty out of range (0..=5): {0}")]
    DifficultyOutOfRange(i32),
}

/// Who controls a nation.
///
/// NOTE: The game also emits a "went AI this turn" code, which does not
/// reliably distinguish defectors from nations that were always AI.
/// Every AI code collapses into `Ai`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Controller {
    Human,
    Ai,
    Dead,
}

impl Controller {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Controller::Human,
            0 | 2 => Controller::Ai,
            _ => Controller::Dead,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    NotChecked,
    Unfinished,
    Finished,
}

impl TurnState {
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => TurnState::Finished,
            1 => TurnState::Unfinished,
            _ => TurnState::NotChecked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nation {
    /// Base name of the nation's files, e.g. `early_ulm` for `early_ulm.2h`.
    pub file_identifier: String,
    pub full_name: String,
    pub short_name: String,
    pub nation_number: i32,
    pub pretender_number: i32,
    pub controller: Controller,
    pub difficulty: u8,
    pub turn_state: TurnState,
}

impl Nation {
    pub fn is_human(&self) -> bool {
        self.controller == Controller::Human
    }

    pub fn is_ai(&self) -> bool {
        self.controller == Controller::Ai
    }

    pub fn was_turn_checked(&self) -> bool {
        self.turn_state != TurnState::NotChecked
    }

    pub fn is_turn_finished(&self) -> bool {
        self.turn_state == TurnState::Finished
    }

    /// Name of the order / pretender file this nation submits.
    pub fn order_file_name(&self) -> String {
        format!("{}.2h", self.file_identifier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnInfo {
    pub turn: i32,
    pub era: i32,
    pub mods: i32,
    pub turn_limit: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDump {
    pub turn: i32,
    pub era: i32,
    pub mods: i32,
    pub turn_limit: i32,
    pub nations: Vec<Nation>,
}

impl StatusDump {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut lines = text.lines();
        // Banner line carries the game name only.
        let _banner = lines.next();
        let turn_line = lines.next().ok_or(ParseError::MissingTurnLine)?;
        let info = parse_turn_line(turn_line)?;

        let nations = lines
            .filter(|l| !l.trim().is_empty())
            .map(parse_nation_line)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            turn: info.turn,
            era: info.era,
            mods: info.mods,
            turn_limit: info.turn_limit,
            nations,
        })
    }

    pub fn has_started(&self) -> bool {
        self.turn > LOBBY_TURN
    }

    /// Human nations whose turn is not marked finished.
    pub fn undone_turns(&self) -> Vec<&Nation> {
        self.nations
            .iter()
            .filter(|n| n.is_human() && !n.is_turn_finished())
            .collect()
    }

    /// Human nations whose turn was never opened.
    pub fn unchecked_turns(&self) -> Vec<&Nation> {
        self.nations
            .iter()
            .filter(|n| n.is_human() && !n.was_turn_checked())
            .collect()
    }
}

pub fn parse_turn_line(line: &str) -> Result<TurnInfo, ParseError> {
    let tokens: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .filter(|t| !t.is_empty())
        .collect();

    let mut turn = None;
    let mut info = TurnInfo::default();
    for pair in tokens.windows(2) {
        let key: &'static str = match pair[0].to_ascii_lowercase().as_str() {
            "turn" => "turn",
            "era" => "era",
            "mods" => "mods",
            "turnlimit" => "turnlimit",
            _ => continue,
        };
        let value = pair[1]
            .parse::<i32>()
            .map_err(|_| ParseError::InvalidTurnValue {
                key,
                value: pair[1].to_string(),
            })?;
        match key {
            "turn" => turn = Some(value),
            "era" => info.era = value,
            "mods" => info.mods = value,
            _ => info.turn_limit = value,
        }
    }

    info.turn = turn.ok_or_else(|| ParseError::MissingTurn(line.to_string()))?;
    Ok(info)
}

pub fn parse_nation_line(line: &str) -> Result<Nation, ParseError> {
    let trimmed = line.trim();
    let rest = trimmed
        .get(..6)
        .filter(|p| p.eq_ignore_ascii_case("nation"))
        .map(|_| &trimmed[6..])
        .ok_or_else(|| ParseError::NotANationLine(line.to_string()))?;

    let mut fields = rest.split('\t').map(str::trim).filter(|f| !f.is_empty());

    // Leading numeric fields; a single field may hold several space-separated numbers.
    let mut numbers = Vec::<i32>::with_capacity(5);
    let mut names = Vec::<&str>::new();
    for field in fields.by_ref() {
        let parsed: Option<Vec<i32>> = field
            .split_whitespace()
            .map(|t| t.parse::<i32>().ok())
            .collect();
        match parsed {
            Some(mut v) => numbers.append(&mut v),
            None => {
                names.push(field);
                break;
            }
        }
    }
    names.extend(fields);

    if numbers.len() != 5 {
        return Err(ParseError::WrongNumberCount {
            found: numbers.len(),
            line: line.to_string(),
        });
    }
    if names.len() < 2 {
        return Err(ParseError::MissingNames(line.to_string()));
    }

    let difficulty = numbers[3];
    if !(0..=5).contains(&difficulty) {
        return Err(ParseError::DifficultyOutOfRange(difficulty));
    }

    Ok(Nation {
        file_identifier: names[0].to_string(),
        full_name: names[1..].join(", "),
        short_name: names[1].to_string(),
        nation_number: numbers[0],
        pretender_number: numbers[1],
        controller: Controller::from_code(numbers[2]),
        difficulty: difficulty as u8,
        turn_state: TurnState::from_code(numbers[4]),
    })
}
