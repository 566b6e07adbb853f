//! Argument templates: `$n` placeholders filled from request path segments.
//!
//! ```text
//! template  ["pim", "$1", "poum"]
//! request   /api/v1/demo/pam
//! argv      ["pim", "pam", "poum"]
//! ```

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("placeholders start at $1, got '{0}'")]
    ZeroIndex(String),

    #[error("placeholder '{0}' is out of range")]
    BadIndex(String),

    #[error("placeholder ${index} needs {index} arguments, got {supplied}")]
    Missing { index: usize, supplied: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    /// 1-based
    Positional(usize),
}

/// A parsed command line template.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Arguments {
    tokens: Vec<Token>,
}

fn is_placeholder(token: &str) -> bool {
    token
        .strip_prefix('$')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

impl Arguments {
    /// Tokens of the form `$<digits>` become placeholders; everything else is literal.
    pub fn parse<I, S>(tokens: I) -> Result<Self, ArgumentError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens = tokens
            .into_iter()
            .map(|token| {
                let token = token.as_ref();
                if !is_placeholder(token) {
                    return Ok(Token::Literal(token.to_string()));
                }
                match token[1..].parse::<usize>() {
                    Ok(0) => Err(ArgumentError::ZeroIndex(token.to_string())),
                    Ok(index) => Ok(Token::Positional(index)),
                    Err(_) => Err(ArgumentError::BadIndex(token.to_string())),
                }
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { tokens })
    }

    /// Highest placeholder index, 0 when there are none.
    pub fn arity(&self) -> usize {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                Token::Positional(i) => Some(*i),
                Token::Literal(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Substitute `args` into the template.
    ///
    /// Extra arguments are ignored; a placeholder past `args.len()` is an error.
    pub fn values<S: AsRef<str>>(&self, args: &[S]) -> Result<Vec<String>, ArgumentError> {
        self.tokens
            .iter()
            .map(|token| match token {
                Token::Literal(s) => Ok(s.clone()),
                Token::Positional(index) => args
                    .get(index - 1)
                    .map(|arg| arg.as_ref().to_string())
                    .ok_or(ArgumentError::Missing {
                        index: *index,
                        supplied: args.len(),
                    }),
            })
            .collect()
    }
}
