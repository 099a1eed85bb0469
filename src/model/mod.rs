pub mod entry;
pub mod filter;
pub mod search;
pub mod value;

pub use entry::{detect_log_level, FieldValues, LogEntry, LogLevel, PaginationInfo};
pub use filter::{parse_filter, FilterLogic, FilterNode, FilterOp};
pub use search::{
    FieldExtraction, LogSearch, PrinterOptions, RefreshOptions, TimeRange, VariableDefinition,
};
pub use value::OptionMap;
