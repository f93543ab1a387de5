pub mod ascii;

pub use ascii::{
    BOS_ID, CharTokenizer, EOS_ID, NEWLINE_ID, SEP_ID, STYLE_IDS, STYLE_NAMES, VOCAB_SIZE,
};
