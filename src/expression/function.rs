//! Per-function collation derivation.
//!
//! Every scalar function maps to a [`Derivation`] through one `match`, so a
//! new function tag cannot be added without deciding how it derives its
//! collation.

use super::charset::{
    CollationContext, CHARSET_ASCII, CHARSET_BIN, COLLATION_BIN, DEFAULT_CHARSET, DEFAULT_COLLATION,
};
use super::collation::{
    check_and_derive, CollationArg, Coercibility, EvalType, ExprCollation, Repertoire,
};
use crate::error::{FrontendError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFunc {
    Concat,
    ConcatWs,
    Lower,
    Lcase,
    Reverse,
    Upper,
    Ucase,
    Quote,
    Coalesce,
    Case,
    Left,
    Right,
    Repeat,
    Trim,
    LTrim,
    RTrim,
    Substr,
    SubstringIndex,
    Replace,
    Substring,
    Mid,
    Translate,
    Insert,
    Lpad,
    Rpad,
    Elt,
    ExportSet,
    MakeSet,
    FindInSet,
    Regexp,
    Field,
    Locate,
    Instr,
    Position,
    Ge,
    Le,
    Gt,
    Lt,
    Eq,
    Ne,
    NullEq,
    Strcmp,
    If,
    Ifnull,
    Like,
    In,
    DateFormat,
    TimeFormat,
    Cast,
    Database,
    User,
    CurrentUser,
    Version,
    CurrentRole,
    TidbVersion,
    Format,
    Space,
    ToBase64,
    Uuid,
    Hex,
    Md5,
    Sha,
    Sha2,
    /// Any function without a dedicated rule.
    Other,
}

impl ScalarFunc {
    /// Look a function up by its lower-case SQL name. Unknown names map to
    /// [`ScalarFunc::Other`].
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "concat" => ScalarFunc::Concat,
            "concat_ws" => ScalarFunc::ConcatWs,
            "lower" => ScalarFunc::Lower,
            "lcase" => ScalarFunc::Lcase,
            "reverse" => ScalarFunc::Reverse,
            "upper" => ScalarFunc::Upper,
            "ucase" => ScalarFunc::Ucase,
            "quote" => ScalarFunc::Quote,
            "coalesce" => ScalarFunc::Coalesce,
            "case" => ScalarFunc::Case,
            "left" => ScalarFunc::Left,
            "right" => ScalarFunc::Right,
            "repeat" => ScalarFunc::Repeat,
            "trim" => ScalarFunc::Trim,
            "ltrim" => ScalarFunc::LTrim,
            "rtrim" => ScalarFunc::RTrim,
            "substr" => ScalarFunc::Substr,
            "substring_index" => ScalarFunc::SubstringIndex,
            "replace" => ScalarFunc::Replace,
            "substring" => ScalarFunc::Substring,
            "mid" => ScalarFunc::Mid,
            "translate" => ScalarFunc::Translate,
            "insert" | "insert_func" => ScalarFunc::Insert,
            "lpad" => ScalarFunc::Lpad,
            "rpad" => ScalarFunc::Rpad,
            "elt" => ScalarFunc::Elt,
            "export_set" => ScalarFunc::ExportSet,
            "make_set" => ScalarFunc::MakeSet,
            "find_in_set" => ScalarFunc::FindInSet,
            "regexp" => ScalarFunc::Regexp,
            "field" => ScalarFunc::Field,
            "locate" => ScalarFunc::Locate,
            "instr" => ScalarFunc::Instr,
            "position" => ScalarFunc::Position,
            "ge" | ">=" => ScalarFunc::Ge,
            "le" | "<=" => ScalarFunc::Le,
            "gt" | ">" => ScalarFunc::Gt,
            "lt" | "<" => ScalarFunc::Lt,
            "eq" | "=" => ScalarFunc::Eq,
            "ne" | "!=" | "<>" => ScalarFunc::Ne,
            "nulleq" | "<=>" => ScalarFunc::NullEq,
            "strcmp" => ScalarFunc::Strcmp,
            "if" => ScalarFunc::If,
            "ifnull" => ScalarFunc::Ifnull,
            "like" => ScalarFunc::Like,
            "in" => ScalarFunc::In,
            "date_format" => ScalarFunc::DateFormat,
            "time_format" => ScalarFunc::TimeFormat,
            "cast" => ScalarFunc::Cast,
            "database" | "schema" => ScalarFunc::Database,
            "user" | "session_user" | "system_user" => ScalarFunc::User,
            "current_user" => ScalarFunc::CurrentUser,
            "version" => ScalarFunc::Version,
            "current_role" => ScalarFunc::CurrentRole,
            "tidb_version" => ScalarFunc::TidbVersion,
            "format" => ScalarFunc::Format,
            "space" => ScalarFunc::Space,
            "to_base64" => ScalarFunc::ToBase64,
            "uuid" => ScalarFunc::Uuid,
            "hex" => ScalarFunc::Hex,
            "md5" => ScalarFunc::Md5,
            "sha" | "sha1" => ScalarFunc::Sha,
            "sha2" => ScalarFunc::Sha2,
            _ => ScalarFunc::Other,
        }
    }

    /// The name used in error messages. Operators print as operators.
    pub fn display_name(self) -> &'static str {
        match self {
            ScalarFunc::Ge => ">=",
            ScalarFunc::Le => "<=",
            ScalarFunc::Gt => ">",
            ScalarFunc::Lt => "<",
            ScalarFunc::Eq => "=",
            ScalarFunc::Ne => "!=",
            ScalarFunc::NullEq => "<=>",
            ScalarFunc::Concat => "concat",
            ScalarFunc::ConcatWs => "concat_ws",
            ScalarFunc::Lower => "lower",
            ScalarFunc::Lcase => "lcase",
            ScalarFunc::Reverse => "reverse",
            ScalarFunc::Upper => "upper",
            ScalarFunc::Ucase => "ucase",
            ScalarFunc::Quote => "quote",
            ScalarFunc::Coalesce => "coalesce",
            ScalarFunc::Case => "case",
            ScalarFunc::Left => "left",
            ScalarFunc::Right => "right",
            ScalarFunc::Repeat => "repeat",
            ScalarFunc::Trim => "trim",
            ScalarFunc::LTrim => "ltrim",
            ScalarFunc::RTrim => "rtrim",
            ScalarFunc::Substr => "substr",
            ScalarFunc::SubstringIndex => "substring_index",
            ScalarFunc::Replace => "replace",
            ScalarFunc::Substring => "substring",
            ScalarFunc::Mid => "mid",
            ScalarFunc::Translate => "translate",
            ScalarFunc::Insert => "insert",
            ScalarFunc::Lpad => "lpad",
            ScalarFunc::Rpad => "rpad",
            ScalarFunc::Elt => "elt",
            ScalarFunc::ExportSet => "export_set",
            ScalarFunc::MakeSet => "make_set",
            ScalarFunc::FindInSet => "find_in_set",
            ScalarFunc::Regexp => "regexp",
            ScalarFunc::Field => "field",
            ScalarFunc::Locate => "locate",
            ScalarFunc::Instr => "instr",
            ScalarFunc::Position => "position",
            ScalarFunc::Strcmp => "strcmp",
            ScalarFunc::If => "if",
            ScalarFunc::Ifnull => "ifnull",
            ScalarFunc::Like => "like",
            ScalarFunc::In => "in",
            ScalarFunc::DateFormat => "date_format",
            ScalarFunc::TimeFormat => "time_format",
            ScalarFunc::Cast => "cast",
            ScalarFunc::Database => "database",
            ScalarFunc::User => "user",
            ScalarFunc::CurrentUser => "current_user",
            ScalarFunc::Version => "version",
            ScalarFunc::CurrentRole => "current_role",
            ScalarFunc::TidbVersion => "tidb_version",
            ScalarFunc::Format => "format",
            ScalarFunc::Space => "space",
            ScalarFunc::ToBase64 => "to_base64",
            ScalarFunc::Uuid => "uuid",
            ScalarFunc::Hex => "hex",
            ScalarFunc::Md5 => "md5",
            ScalarFunc::Sha => "sha",
            ScalarFunc::Sha2 => "sha2",
            ScalarFunc::Other => "function",
        }
    }

    pub fn derivation(self) -> Derivation {
        use ArgSelection::*;
        use Derivation::*;
        use ResultKind::*;

        match self {
            ScalarFunc::Concat
            | ScalarFunc::ConcatWs
            | ScalarFunc::Lower
            | ScalarFunc::Lcase
            | ScalarFunc::Reverse
            | ScalarFunc::Upper
            | ScalarFunc::Ucase
            | ScalarFunc::Quote
            | ScalarFunc::Coalesce
            | ScalarFunc::Case => Aggregate(All, Declared),
            ScalarFunc::Left
            | ScalarFunc::Right
            | ScalarFunc::Repeat
            | ScalarFunc::Trim
            | ScalarFunc::LTrim
            | ScalarFunc::RTrim
            | ScalarFunc::Substr
            | ScalarFunc::SubstringIndex
            | ScalarFunc::Replace
            | ScalarFunc::Substring
            | ScalarFunc::Mid
            | ScalarFunc::Translate => Aggregate(Indexes(&[0]), Declared),
            ScalarFunc::Insert => Aggregate(Indexes(&[0, 3]), Declared),
            ScalarFunc::Lpad | ScalarFunc::Rpad => Aggregate(Indexes(&[0, 2]), Declared),
            ScalarFunc::Elt | ScalarFunc::ExportSet | ScalarFunc::MakeSet => {
                Aggregate(Tail(1), Declared)
            }
            ScalarFunc::FindInSet | ScalarFunc::Regexp => Aggregate(All, Int),
            ScalarFunc::Field => WhenFirstArgString(All, Declared),
            ScalarFunc::Locate | ScalarFunc::Instr | ScalarFunc::Position => {
                Aggregate(Indexes(&[0, 1]), Declared)
            }
            ScalarFunc::Ge
            | ScalarFunc::Le
            | ScalarFunc::Gt
            | ScalarFunc::Lt
            | ScalarFunc::Eq
            | ScalarFunc::Ne
            | ScalarFunc::NullEq
            | ScalarFunc::Strcmp => Comparison(All, true),
            ScalarFunc::If => Aggregate(Indexes(&[1, 2]), Declared),
            ScalarFunc::Ifnull => Aggregate(Indexes(&[0, 1]), Declared),
            ScalarFunc::Like => Comparison(Indexes(&[0, 1]), false),
            ScalarFunc::In => WhenFirstArgString(All, Int),
            ScalarFunc::DateFormat | ScalarFunc::TimeFormat => FormatPattern(1),
            ScalarFunc::Cast => Cast,
            ScalarFunc::Database
            | ScalarFunc::User
            | ScalarFunc::CurrentUser
            | ScalarFunc::Version
            | ScalarFunc::CurrentRole
            | ScalarFunc::TidbVersion => SystemConstant,
            ScalarFunc::Format
            | ScalarFunc::Space
            | ScalarFunc::ToBase64
            | ScalarFunc::Uuid
            | ScalarFunc::Hex
            | ScalarFunc::Md5
            | ScalarFunc::Sha
            | ScalarFunc::Sha2 => AsciiEncoded,
            ScalarFunc::Other => ByResultType,
        }
    }
}

/// Which arguments take part in the aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSelection {
    All,
    Indexes(&'static [usize]),
    /// Every argument from this index on.
    Tail(usize),
}

impl ArgSelection {
    fn select<'a>(
        self,
        func: ScalarFunc,
        args: &'a [CollationArg],
    ) -> Result<Vec<&'a CollationArg>> {
        match self {
            ArgSelection::All => Ok(args.iter().collect()),
            ArgSelection::Indexes(indexes) => indexes
                .iter()
                .map(|&i| {
                    args.get(i)
                        .ok_or_else(|| FrontendError::wrong_param_count(func.display_name()))
                })
                .collect(),
            ArgSelection::Tail(start) => args
                .get(start..)
                .map(|tail| tail.iter().collect())
                .ok_or_else(|| FrontendError::wrong_param_count(func.display_name())),
        }
    }
}

/// The eval type handed to the aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// The function's own result type.
    Declared,
    Int,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivation {
    Aggregate(ArgSelection, ResultKind),
    /// Aggregate only when the first argument is a string, otherwise fall
    /// back to [`Derivation::ByResultType`].
    WhenFirstArgString(ArgSelection, ResultKind),
    /// Aggregate with an int result, then report `(NUMERIC, ASCII)`. The bool
    /// says whether a non-string first argument skips aggregation.
    Comparison(ArgSelection, bool),
    /// Coercibility and repertoire of the pattern argument, connection charset.
    FormatPattern(usize),
    Cast,
    SystemConstant,
    AsciiEncoded,
    ByResultType,
}

/// Derive the collation of `func(args)` returning `ret_type`.
pub fn derive_collation(
    ctx: &CollationContext,
    func: ScalarFunc,
    args: &[CollationArg],
    ret_type: EvalType,
) -> Result<ExprCollation> {
    let name = func.display_name();
    let first_is_string = args.first().map(|a| a.eval_type.is_string());

    match func.derivation() {
        Derivation::Aggregate(selection, kind) => {
            let selected = selection.select(func, args)?;
            check_and_derive(ctx, name, kind.eval_type(ret_type), &selected)
        }
        Derivation::WhenFirstArgString(selection, kind) => match first_is_string {
            Some(true) => {
                let selected = selection.select(func, args)?;
                check_and_derive(ctx, name, kind.eval_type(ret_type), &selected)
            }
            Some(false) => Ok(by_result_type(ctx, ret_type)),
            None => Err(FrontendError::wrong_param_count(name)),
        },
        Derivation::Comparison(selection, only_strings) => {
            match first_is_string {
                None => return Err(FrontendError::wrong_param_count(name)),
                Some(false) if only_strings => return Ok(by_result_type(ctx, ret_type)),
                _ => {}
            }
            let selected = selection.select(func, args)?;
            let mut ec = check_and_derive(ctx, name, EvalType::Int, &selected)?;
            ec.coercibility = Coercibility::Numeric;
            ec.repertoire = Repertoire::ASCII;
            Ok(ec)
        }
        Derivation::FormatPattern(index) => {
            let pattern = args
                .get(index)
                .ok_or_else(|| FrontendError::wrong_param_count(name))?;
            Ok(ExprCollation::new(
                pattern.coercibility,
                pattern.repertoire,
                &ctx.charset,
                &ctx.collation,
            ))
        }
        Derivation::Cast => {
            let source = args
                .first()
                .ok_or_else(|| FrontendError::wrong_param_count(name))?;
            let mut ec = ExprCollation::new(
                source.coercibility,
                source.repertoire,
                &source.charset,
                &source.collation,
            );
            if ret_type.is_string() && !source.eval_type.is_string() {
                ec.charset = ctx.charset.clone();
                ec.collation = ctx.collation.clone();
            }
            Ok(ec)
        }
        Derivation::SystemConstant => Ok(ExprCollation::new(
            Coercibility::Sysconst,
            Repertoire::UNICODE,
            DEFAULT_CHARSET,
            DEFAULT_COLLATION,
        )),
        Derivation::AsciiEncoded => Ok(ExprCollation::new(
            Coercibility::Coercible,
            Repertoire::ASCII,
            &ctx.charset,
            &ctx.collation,
        )),
        Derivation::ByResultType => Ok(by_result_type(ctx, ret_type)),
    }
}

/// Resolve by SQL function name.
pub fn resolve(
    ctx: &CollationContext,
    func_name: &str,
    args: &[CollationArg],
    ret_type: EvalType,
) -> Result<ExprCollation> {
    derive_collation(ctx, ScalarFunc::from_name(func_name), args, ret_type)
}

impl ResultKind {
    fn eval_type(self, declared: EvalType) -> EvalType {
        match self {
            ResultKind::Declared => declared,
            ResultKind::Int => EvalType::Int,
        }
    }
}

fn by_result_type(ctx: &CollationContext, ret_type: EvalType) -> ExprCollation {
    if !ret_type.is_string() {
        return ExprCollation::new(
            Coercibility::Numeric,
            Repertoire::ASCII,
            CHARSET_BIN,
            COLLATION_BIN,
        );
    }
    let repertoire = if ctx.charset == CHARSET_ASCII {
        Repertoire::ASCII
    } else {
        Repertoire::UNICODE
    };
    ExprCollation::new(
        Coercibility::Coercible,
        repertoire,
        &ctx.charset,
        &ctx.collation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CollationContext {
        CollationContext::default()
    }

    #[test]
    fn test_concat_of_numbers_uses_connection_charset() {
        let ctx = CollationContext::new("utf8", "utf8_general_ci");
        let args = [
            CollationArg::numeric_literal("1"),
            CollationArg::numeric_literal("2"),
        ];
        let ec = resolve(&ctx, "concat", &args, EvalType::String).unwrap();
        assert_eq!(ec.charset, "utf8");
        assert_eq!(ec.collation, "utf8_general_ci");
        assert_eq!(ec.coercibility, Coercibility::Coercible);
        assert_eq!(ec.repertoire, Repertoire::ASCII);
    }

    #[test]
    fn test_substring_only_looks_at_first_arg() {
        let args = [
            CollationArg::column("gbk", "gbk_chinese_ci"),
            CollationArg::column("latin1", "latin1_bin").with_collate("latin1_bin"),
        ];
        let ec = resolve(&ctx(), "substring", &args, EvalType::String).unwrap();
        assert_eq!(ec.collation, "gbk_chinese_ci");
        assert_eq!(ec.coercibility, Coercibility::Implicit);
    }

    #[test]
    fn test_comparison_forces_numeric_ascii() {
        let args = [
            CollationArg::column("utf8mb4", "utf8mb4_general_ci"),
            CollationArg::string_literal(&ctx(), "é"),
        ];
        let ec = resolve(&ctx(), "eq", &args, EvalType::Int).unwrap();
        assert_eq!(ec.collation, "utf8mb4_general_ci");
        assert_eq!(ec.coercibility, Coercibility::Numeric);
        assert_eq!(ec.repertoire, Repertoire::ASCII);

        let ec = resolve(&ctx(), "like", &args, EvalType::Int).unwrap();
        assert_eq!(ec.coercibility, Coercibility::Numeric);
    }

    #[test]
    fn test_numeric_comparison_skips_aggregation() {
        let args = [
            CollationArg::typed_column(EvalType::Int),
            CollationArg::numeric_literal("3"),
        ];
        let ec = resolve(&ctx(), ">", &args, EvalType::Int).unwrap();
        assert_eq!(ec.charset, "binary");
        assert_eq!(ec.coercibility, Coercibility::Numeric);
    }

    #[test]
    fn test_comparison_error_uses_operator_name() {
        let args = [
            CollationArg::column("latin1", "latin1_swedish_ci").with_collate("latin1_swedish_ci"),
            CollationArg::column("gbk", "gbk_bin").with_collate("gbk_bin"),
        ];
        let err = resolve(&ctx(), "eq", &args, EvalType::Int).unwrap_err();
        assert!(err.to_string().ends_with("for operation '='"), "{}", err);
    }

    #[test]
    fn test_cast_of_number_to_string_uses_connection_charset() {
        let ctx = CollationContext::new("gbk", "gbk_chinese_ci");
        let args = [CollationArg::typed_column(EvalType::Int)];
        let ec = resolve(&ctx, "cast", &args, EvalType::String).unwrap();
        assert_eq!(ec.charset, "gbk");
        assert_eq!(ec.coercibility, Coercibility::Numeric);

        let args = [CollationArg::column("latin1", "latin1_bin")];
        let ec = resolve(&ctx, "cast", &args, EvalType::String).unwrap();
        assert_eq!(ec.charset, "latin1");
        assert_eq!(ec.collation, "latin1_bin");
    }

    #[test]
    fn test_system_and_encoding_functions() {
        let ctx = CollationContext::new("gbk", "gbk_chinese_ci");
        let ec = resolve(&ctx, "version", &[], EvalType::String).unwrap();
        assert_eq!(
            ec,
            ExprCollation::new(Coercibility::Sysconst, Repertoire::UNICODE, "utf8mb4", "utf8mb4_bin")
        );

        let args = [CollationArg::column("utf8mb4", "utf8mb4_general_ci")];
        let ec = resolve(&ctx, "md5", &args, EvalType::String).unwrap();
        assert_eq!(
            ec,
            ExprCollation::new(Coercibility::Coercible, Repertoire::ASCII, "gbk", "gbk_chinese_ci")
        );
    }

    #[test]
    fn test_date_format_takes_pattern_coercibility() {
        let args = [
            CollationArg::typed_column(EvalType::Datetime),
            CollationArg::string_literal(&ctx(), "%Y-%m"),
        ];
        let ec = resolve(&ctx(), "date_format", &args, EvalType::String).unwrap();
        assert_eq!(ec.coercibility, Coercibility::Coercible);
        assert_eq!(ec.repertoire, Repertoire::ASCII);
        assert_eq!(ec.collation, "utf8mb4_bin");
    }

    #[test]
    fn test_unknown_function_derives_from_result_type() {
        let ec = resolve(&ctx(), "abs", &[], EvalType::Int).unwrap();
        assert_eq!(ec.collation, "binary");
        let ascii = CollationContext::new("ascii", "ascii_bin");
        let ec = resolve(&ascii, "my_udf", &[], EvalType::String).unwrap();
        assert_eq!(ec.repertoire, Repertoire::ASCII);
        assert_eq!(ec.coercibility, Coercibility::Coercible);
    }

    #[test]
    fn test_short_argument_lists_are_rejected() {
        let one = [CollationArg::column("utf8mb4", "utf8mb4_bin")];
        for name in ["insert", "lpad", "if", "locate", "date_format"] {
            let err = resolve(&ctx(), name, &one, EvalType::String).unwrap_err();
            assert_eq!(err.to_sql_error().code, 1582, "{}", name);
        }
        let err = resolve(&ctx(), "cast", &[], EvalType::String).unwrap_err();
        assert_eq!(err.to_sql_error().code, 1582);
        let err = resolve(&ctx(), "elt", &[], EvalType::String).unwrap_err();
        assert_eq!(err.to_sql_error().code, 1582);
    }

    #[test]
    fn test_elt_ignores_index_argument() {
        let args = [
            CollationArg::numeric_literal("1"),
            CollationArg::column("latin1", "latin1_bin"),
            CollationArg::column("latin1", "latin1_bin"),
        ];
        let ec = resolve(&ctx(), "elt", &args, EvalType::String).unwrap();
        assert_eq!(ec.charset, "latin1");
        assert_eq!(ec.coercibility, Coercibility::Implicit);
    }

    #[test]
    fn test_every_name_round_trips() {
        for name in ["concat", "substring_index", "export_set", "find_in_set", "tidb_version", "sha2"] {
            assert_eq!(ScalarFunc::from_name(name).display_name(), name);
        }
        assert_eq!(ScalarFunc::from_name("CONCAT"), ScalarFunc::Concat);
        assert_eq!(ScalarFunc::from_name("nope"), ScalarFunc::Other);
    }
}
