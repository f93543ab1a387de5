//! Character tokenizer shared with the character LM weights.
//!
//! - Special tokens occupy IDs 0..=11
//! - Printable ASCII (0x20..=0x7E) occupies IDs 12..=106
//! - Newlines are represented explicitly via `<NEWLINE>` (ID 7)

use crate::scoring::TextTokenizer;

pub const PAD_ID: u32 = 0;
pub const BOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const UNK_ID: u32 = 3;
pub const SEP_ID: u32 = 4;
pub const WIDTH_ID: u32 = 5;
pub const HEIGHT_ID: u32 = 6;
pub const NEWLINE_ID: u32 = 7;
pub const STYLE_ART_ID: u32 = 8;
pub const STYLE_BANNER_ID: u32 = 9;
pub const STYLE_SIMPLE_ID: u32 = 10;
pub const STYLE_DETAILED_ID: u32 = 11;

pub const NUM_SPECIAL_TOKENS: u32 = 12;
pub const PRINTABLE_ASCII_START: u32 = NUM_SPECIAL_TOKENS;
pub const PRINTABLE_ASCII_LEN: u32 = 95;
pub const PRINTABLE_ASCII_END: u32 = PRINTABLE_ASCII_START + PRINTABLE_ASCII_LEN - 1;

pub const VOCAB_SIZE: u32 = NUM_SPECIAL_TOKENS + PRINTABLE_ASCII_LEN;

/// Style names in label order; label `i` is `STYLE_IDS[i]`.
pub const STYLE_NAMES: [&str; 4] = ["art", "banner", "simple", "detailed"];
pub const STYLE_IDS: [u32; 4] = [STYLE_ART_ID, STYLE_BANNER_ID, STYLE_SIMPLE_ID, STYLE_DETAILED_ID];

/// Stateless fixed mapping between characters and ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct CharTokenizer;

impl CharTokenizer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Style token ids, indexed by style label.
    #[must_use]
    pub fn style_ids(self) -> [u32; 4] {
        STYLE_IDS
    }

    /// Label of a style name, case-insensitive.
    #[must_use]
    pub fn style_label(self, style: &str) -> Option<usize> {
        let style = style.trim().to_ascii_lowercase();
        STYLE_NAMES.iter().position(|name| *name == style)
    }

    /// `<BOS> <STYLE> <SEP>`: the context a styled continuation follows.
    #[must_use]
    pub fn style_prompt(self, style_id: u32) -> Vec<u32> {
        vec![BOS_ID, style_id, SEP_ID]
    }

    #[must_use]
    pub fn is_output_token(self, token_id: u32) -> bool {
        token_id == NEWLINE_ID || (PRINTABLE_ASCII_START..=PRINTABLE_ASCII_END).contains(&token_id)
    }

    #[must_use]
    pub fn encode_char(self, ch: char) -> u32 {
        match ch {
            '\n' => NEWLINE_ID,
            ' '..='~' => PRINTABLE_ASCII_START + (u32::from(ch) - 0x20),
            _ => UNK_ID,
        }
    }

    /// Output character of a token; `None` for control and style ids.
    #[must_use]
    pub fn decode_token(self, token_id: u32) -> Option<char> {
        if token_id == NEWLINE_ID {
            return Some('\n');
        }
        if !(PRINTABLE_ASCII_START..=PRINTABLE_ASCII_END).contains(&token_id) {
            return None;
        }
        char::from_u32(0x20 + token_id - PRINTABLE_ASCII_START)
    }
}

impl TextTokenizer for CharTokenizer {
    /// `<BOS> text <SEP>`.
    fn encode(&self, text: &str) -> Vec<u32> {
        std::iter::once(BOS_ID)
            .chain(text.chars().map(|ch| self.encode_char(ch)))
            .chain(std::iter::once(SEP_ID))
            .collect()
    }

    fn encode_plain(&self, text: &str) -> Vec<u32> {
        text.chars().map(|ch| self.encode_char(ch)).collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        ids.iter().filter_map(|&id| self.decode_token(id)).collect()
    }

    fn eos_id(&self) -> u32 {
        EOS_ID
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE as usize
    }
}
