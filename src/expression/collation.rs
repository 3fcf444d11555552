//! Collation aggregation over the arguments of a string expression.
//!
//! Arguments are folded left to right, `agg(a, b, c) = agg(agg(a, b), c)`.
//! The fold is not commutative. A pair that cannot be resolved collapses to
//! `(NONE, binary)` on the spot, and an argument that would have dominated
//! both members may no longer win once that happened. MySQL behaves the same
//! way, so the order dependence is kept.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use super::charset::{
    self, bin_collation, is_bin_collation, is_unicode, is_valid_string, CollationContext,
    CHARSET_ASCII, CHARSET_BIN, CHARSET_UTF8, CHARSET_UTF8MB4, COLLATION_BIN, DEFAULT_CHARSET,
    DEFAULT_COLLATION,
};
use crate::error::{
    FrontendError, Result, ER_CANT_AGGREGATE_2COLLATIONS, ER_CANT_AGGREGATE_3COLLATIONS,
    ER_CANT_AGGREGATE_NCOLLATIONS,
};

/// How strongly an expression holds on to its collation. Lower wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Coercibility {
    /// An explicit `COLLATE` clause.
    Explicit = 0,
    /// A mix that could not be resolved.
    None = 1,
    /// A column or a variable.
    Implicit = 2,
    /// `USER()`, `VERSION()` and friends.
    Sysconst = 3,
    /// A string literal.
    Coercible = 4,
    /// A number or a temporal value.
    Numeric = 5,
    /// `NULL`.
    Ignorable = 6,
}

impl Coercibility {
    pub fn name(self) -> &'static str {
        match self {
            Coercibility::Explicit => "EXPLICIT",
            Coercibility::None => "NONE",
            Coercibility::Implicit => "IMPLICIT",
            Coercibility::Sysconst => "SYSCONST",
            Coercibility::Coercible => "COERCIBLE",
            Coercibility::Numeric => "NUMERIC",
            Coercibility::Ignorable => "IGNORABLE",
        }
    }
}

impl fmt::Display for Coercibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which characters an expression's values may contain, as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Repertoire(u8);

impl Repertoire {
    /// U+0000..U+007F only.
    pub const ASCII: Repertoire = Repertoire(0x01);
    /// U+0080 and above.
    pub const EXTENDED: Repertoire = Repertoire(0x02);
    pub const UNICODE: Repertoire = Repertoire(0x03);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn of_str(s: &str) -> Self {
        if s.is_ascii() {
            Repertoire::ASCII
        } else {
            Repertoire::UNICODE
        }
    }
}

impl BitOr for Repertoire {
    type Output = Repertoire;

    fn bitor(self, rhs: Self) -> Self::Output {
        Repertoire(self.0 | rhs.0)
    }
}

impl BitOrAssign for Repertoire {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The evaluation type of an expression or of a function result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvalType {
    Int,
    Real,
    Decimal,
    String,
    Datetime,
    Timestamp,
    Duration,
    Json,
}

impl EvalType {
    pub fn is_string(self) -> bool {
        self == EvalType::String
    }
}

/// The derived collation of an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprCollation {
    pub coercibility: Coercibility,
    pub repertoire: Repertoire,
    pub charset: String,
    pub collation: String,
}

impl ExprCollation {
    pub fn new(
        coercibility: Coercibility,
        repertoire: Repertoire,
        charset: &str,
        collation: &str,
    ) -> Self {
        Self {
            coercibility,
            repertoire,
            charset: charset.to_string(),
            collation: collation.to_string(),
        }
    }
}

/// One argument as the resolver sees it: its declared type plus, for
/// literals, the value used by the lossless-conversion check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollationArg {
    pub charset: String,
    pub collation: String,
    pub coercibility: Coercibility,
    pub repertoire: Repertoire,
    pub eval_type: EvalType,
    /// `Some(None)` is a NULL literal, `None` anything that is not a constant.
    pub constant: Option<Option<String>>,
}

impl CollationArg {
    /// A string literal in the connection charset.
    pub fn string_literal(ctx: &CollationContext, value: &str) -> Self {
        Self::string_literal_in(&ctx.charset, &ctx.collation, value)
    }

    /// A string literal with an introducer, e.g. `_gbk'abc'`.
    pub fn string_literal_in(charset: &str, collation: &str, value: &str) -> Self {
        Self {
            charset: charset.to_string(),
            collation: collation.to_string(),
            coercibility: Coercibility::Coercible,
            repertoire: Repertoire::of_str(value),
            eval_type: EvalType::String,
            constant: Some(Some(value.to_string())),
        }
    }

    pub fn numeric_literal(value: &str) -> Self {
        Self {
            charset: CHARSET_BIN.to_string(),
            collation: COLLATION_BIN.to_string(),
            coercibility: Coercibility::Numeric,
            repertoire: Repertoire::ASCII,
            eval_type: EvalType::Int,
            constant: Some(Some(value.to_string())),
        }
    }

    pub fn null_literal() -> Self {
        Self {
            charset: CHARSET_BIN.to_string(),
            collation: COLLATION_BIN.to_string(),
            coercibility: Coercibility::Ignorable,
            repertoire: Repertoire::ASCII,
            eval_type: EvalType::String,
            constant: Some(None),
        }
    }

    /// A string column. Columns in a non-ASCII charset may hold anything.
    pub fn column(charset: &str, collation: &str) -> Self {
        let repertoire = if charset == CHARSET_ASCII {
            Repertoire::ASCII
        } else {
            Repertoire::UNICODE
        };
        Self {
            charset: charset.to_string(),
            collation: collation.to_string(),
            coercibility: Coercibility::Implicit,
            repertoire,
            eval_type: EvalType::String,
            constant: None,
        }
    }

    /// A column of a non-string type.
    pub fn typed_column(eval_type: EvalType) -> Self {
        if eval_type.is_string() {
            return Self::column(DEFAULT_CHARSET, DEFAULT_COLLATION);
        }
        Self {
            charset: CHARSET_BIN.to_string(),
            collation: COLLATION_BIN.to_string(),
            coercibility: Coercibility::Numeric,
            repertoire: Repertoire::ASCII,
            eval_type,
            constant: None,
        }
    }

    /// Apply a `COLLATE` clause. The charset follows the collation when the
    /// collation is known.
    pub fn with_collate(mut self, collation: &str) -> Self {
        if let Some(c) = charset::collation_by_name(collation) {
            self.charset = c.charset.to_string();
            self.collation = c.name.to_string();
        } else {
            self.collation = collation.to_string();
        }
        self.coercibility = Coercibility::Explicit;
        self
    }

    pub fn with_repertoire(mut self, repertoire: Repertoire) -> Self {
        self.repertoire = repertoire;
        self
    }

    pub fn with_coercibility(mut self, coercibility: Coercibility) -> Self {
        self.coercibility = coercibility;
        self
    }

    pub fn with_eval_type(mut self, eval_type: EvalType) -> Self {
        self.eval_type = eval_type;
        self
    }
}

/// Fold the arguments into one collation. `None` means the mix cannot be
/// resolved.
pub fn infer_collation(args: &[CollationArg]) -> Option<ExprCollation> {
    let refs: Vec<&CollationArg> = args.iter().collect();
    infer(&refs)
}

pub(crate) fn infer(args: &[&CollationArg]) -> Option<ExprCollation> {
    let (first, rest) = match args.split_first() {
        Some(split) => split,
        None => {
            return Some(ExprCollation::new(
                Coercibility::Ignorable,
                Repertoire::UNICODE,
                DEFAULT_CHARSET,
                DEFAULT_COLLATION,
            ))
        }
    };

    let mut repertoire = first.repertoire;
    let mut coercibility = first.coercibility;
    let mut dst_charset: &str = &first.charset;
    let mut dst_collation: &str = &first.collation;
    let mut unknown_charset = false;

    for arg in rest {
        // Binary mixes with anything. On a coercibility tie binary wins.
        if dst_collation == COLLATION_BIN || arg.collation == COLLATION_BIN {
            if coercibility > arg.coercibility
                || (coercibility == arg.coercibility && arg.collation == COLLATION_BIN)
            {
                coercibility = arg.coercibility;
                dst_charset = &arg.charset;
                dst_collation = &arg.collation;
            }
            repertoire |= arg.repertoire;
            continue;
        }

        if dst_charset != arg.charset {
            let arg_unicode = is_unicode(&arg.charset);
            let dst_unicode = is_unicode(dst_charset);
            let mut take_arg = false;
            let resolved = match coercibility.cmp(&arg.coercibility) {
                std::cmp::Ordering::Less => {
                    arg.repertoire == Repertoire::ASCII
                        || arg.coercibility >= Coercibility::Sysconst
                        || dst_unicode
                }
                std::cmp::Ordering::Equal => {
                    if (dst_unicode && !arg_unicode)
                        || (dst_charset == CHARSET_UTF8MB4 && arg.charset == CHARSET_UTF8)
                    {
                        true
                    } else if (arg_unicode && !dst_unicode)
                        || (arg.charset == CHARSET_UTF8MB4 && dst_charset == CHARSET_UTF8)
                    {
                        take_arg = true;
                        true
                    } else if repertoire == Repertoire::ASCII
                        && arg.repertoire != Repertoire::ASCII
                    {
                        take_arg = true;
                        true
                    } else {
                        repertoire != Repertoire::ASCII && arg.repertoire == Repertoire::ASCII
                    }
                }
                std::cmp::Ordering::Greater => {
                    take_arg = repertoire == Repertoire::ASCII
                        || coercibility >= Coercibility::Sysconst
                        || arg_unicode;
                    take_arg
                }
            };

            repertoire |= arg.repertoire;
            if !resolved {
                // Wait for an explicit COLLATE further up the fold.
                coercibility = Coercibility::None;
                dst_charset = CHARSET_BIN;
                dst_collation = COLLATION_BIN;
                unknown_charset = true;
            } else if take_arg {
                coercibility = arg.coercibility;
                dst_charset = &arg.charset;
                dst_collation = &arg.collation;
            }
            continue;
        }

        if coercibility == arg.coercibility {
            if dst_collation == arg.collation {
                // keep
            } else if coercibility == Coercibility::Explicit {
                return None;
            } else if is_bin_collation(dst_collation) {
                // keep
            } else if is_bin_collation(&arg.collation) {
                coercibility = arg.coercibility;
                dst_charset = &arg.charset;
                dst_collation = &arg.collation;
            } else {
                coercibility = Coercibility::None;
                dst_charset = &arg.charset;
                dst_collation = bin_collation(&arg.charset);
            }
        } else if coercibility > arg.coercibility {
            coercibility = arg.coercibility;
            dst_charset = &arg.charset;
            dst_collation = &arg.collation;
        }
        repertoire |= arg.repertoire;
    }

    if unknown_charset && coercibility != Coercibility::Explicit {
        return None;
    }

    Some(ExprCollation::new(
        coercibility,
        repertoire,
        dst_charset,
        dst_collation,
    ))
}

/// Infer, then validate that every argument can be converted to the result
/// charset without loss.
pub fn check_and_derive(
    ctx: &CollationContext,
    func_name: &str,
    eval_type: EvalType,
    args: &[&CollationArg],
) -> Result<ExprCollation> {
    let mut ec = infer(args).ok_or_else(|| illegal_mix_error(func_name, args))?;

    if !eval_type.is_string() && ec.coercibility == Coercibility::None {
        return Err(illegal_mix_error(func_name, args));
    }

    if eval_type.is_string() && ec.coercibility == Coercibility::Numeric {
        ec.charset = ctx.charset.clone();
        ec.collation = ctx.collation.clone();
        ec.coercibility = Coercibility::Coercible;
        ec.repertoire = Repertoire::ASCII;
    }

    if !safe_convert(&ec, args) {
        return Err(illegal_mix_error(func_name, args));
    }

    Ok(ec)
}

fn safe_convert(ec: &ExprCollation, args: &[&CollationArg]) -> bool {
    args.iter()
        .filter(|arg| arg.charset != ec.charset && arg.repertoire != Repertoire::ASCII)
        .all(|arg| match &arg.constant {
            Some(Some(value)) => is_valid_string(value, &ec.charset),
            Some(None) => true,
            None => {
                arg.collation == COLLATION_BIN
                    || ec.charset == CHARSET_BIN
                    || is_unicode(&ec.charset)
            }
        })
}

/// The MySQL error for an unresolvable mix, shaped by the argument count.
pub fn illegal_mix_error(func_name: &str, args: &[&CollationArg]) -> FrontendError {
    let pair = |arg: &CollationArg| format!("({},{})", arg.collation, arg.coercibility);
    match args {
        [a, b] => FrontendError::IllegalMixCollation {
            code: ER_CANT_AGGREGATE_2COLLATIONS,
            message: format!(
                "Illegal mix of collations {} and {} for operation '{}'",
                pair(a),
                pair(b),
                func_name
            ),
        },
        [a, b, c] => FrontendError::IllegalMixCollation {
            code: ER_CANT_AGGREGATE_3COLLATIONS,
            message: format!(
                "Illegal mix of collations {}, {}, {} for operation '{}'",
                pair(a),
                pair(b),
                pair(c),
                func_name
            ),
        },
        _ => FrontendError::IllegalMixCollation {
            code: ER_CANT_AGGREGATE_NCOLLATIONS,
            message: format!("Illegal mix of collations for operation '{}'", func_name),
        },
    }
}
