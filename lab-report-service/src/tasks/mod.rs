//! One graph task per pipeline step, plus the stage functions they wrap.

pub mod categorization;
pub mod explanation;
pub mod structuring;
pub mod summarization;
pub mod table_formatting;
pub mod text_extract;
pub mod types;
pub mod utils;

pub use categorization::{CategorizationTask, categorize_records};
pub use explanation::{ExplanationTask, explain_results};
pub use structuring::{StructuringTask, structure_text};
pub use summarization::{SummarizationTask, summarize_explanation};
pub use table_formatting::{FormattedTable, TableFormattingTask, format_table};
pub use text_extract::TextExtractTask;
pub use types::{
    EXPLANATION_UNAVAILABLE, MalformedOutput, SUMMARY_UNAVAILABLE, StageOutcome, context_keys,
};
pub use utils::{encode_records, parse_record_array, strip_code_fence};
