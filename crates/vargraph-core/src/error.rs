//! Error types for vargraph
//!
//! Every failure carries enough context for a user to find the faulty
//! placeholder: the document path, the original expression text, and an
//! actionable help message where one exists.

use std::fmt;

/// Result type alias for vargraph operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vargraph operations
#[derive(Debug, Clone)]
pub struct Error {
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Path in the document where the error occurred (e.g., "provider.region")
    pub path: Option<String>,
    /// Original placeholder text the error relates to
    pub expression: Option<String>,
    /// Source location (file, line) if available
    pub source_location: Option<SourceLocation>,
    /// Actionable help message
    pub help: Option<String>,
    /// Underlying cause (as string for Clone compatibility)
    pub cause: Option<String>,
}

/// Location in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

/// Categories of errors that can occur
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error parsing the YAML/JSON document itself
    Parse,
    /// Malformed placeholder syntax in the source document
    Syntax,
    /// Placeholders depend on each other in a loop
    CyclicReference,
    /// Error while dispatching or running a resolver
    Resolver(ResolverErrorKind),
    /// A non-string value was embedded in a larger string
    NonStringTemplate { type_name: String },
    /// Both `provider.profile` and `provider.resolver` are configured
    CredentialConflict,
    /// Invalid engine configuration (stage declarations, options, ...)
    Configuration,
    /// Error accessing a path that doesn't exist
    PathNotFound,
    /// I/O error (file not found, etc.)
    Io,
    /// Internal error (bug in vargraph)
    Internal,
}

/// Specific resolver error categories
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverErrorKind {
    /// No provider registered (or visible) under this name
    ProviderNotFound { provider: String },
    /// Provider exists but has no resolver for the requested type
    ResolverNotFound { provider: String, resolver: String },
    /// Resolver ran and returned an error
    Failed {
        provider: String,
        resolver: String,
        key: String,
        message: String,
    },
    /// Every candidate of a placeholder came back missing
    CannotResolve,
}

impl Error {
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            path: None,
            expression: None,
            source_location: None,
            help: None,
            cause: None,
        }
    }

    /// Create a new document parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            cause: Some(message.into()),
            ..Self::new(ErrorKind::Parse)
        }
    }

    /// Create a placeholder syntax error for the offending text
    pub fn syntax(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            expression: Some(expression.into()),
            help: Some(
                "Placeholders look like ${provider(params):type:key, \"fallback\"}".into(),
            ),
            cause: Some(message.into()),
            ..Self::new(ErrorKind::Syntax)
        }
    }

    /// Create a cyclic reference error; `chain` lists the expressions in the loop
    pub fn cyclic_reference(path: impl Into<String>, chain: Vec<String>) -> Self {
        let chain_str = chain.join(" -> ");
        Self {
            path: Some(path.into()),
            help: Some("Break the cycle by removing one of the references".into()),
            cause: Some(format!("Chain: {}", chain_str)),
            ..Self::new(ErrorKind::CyclicReference)
        }
    }

    /// Create a provider not found error
    pub fn provider_not_found(provider: impl Into<String>) -> Self {
        let p = provider.into();
        Self {
            help: Some(format!(
                "Register the '{}' provider, declare it under stages.<stage>.resolvers, or check for typos",
                p
            )),
            ..Self::new(ErrorKind::Resolver(ResolverErrorKind::ProviderNotFound {
                provider: p,
            }))
        }
    }

    /// Create a resolver not found error
    pub fn resolver_not_found(provider: impl Into<String>, resolver: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resolver(ResolverErrorKind::ResolverNotFound {
            provider: provider.into(),
            resolver: resolver.into(),
        }))
    }

    /// Wrap an error returned by a resolver
    pub fn resolver_failed(
        provider: impl Into<String>,
        resolver: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let provider = provider.into();
        Self {
            help: Some(format!("Check the '{}' provider configuration", provider)),
            ..Self::new(ErrorKind::Resolver(ResolverErrorKind::Failed {
                provider,
                resolver: resolver.into(),
                key: key.into(),
                message: message.into(),
            }))
        }
    }

    /// Create a "cannot resolve" error: every candidate came back missing
    pub fn cannot_resolve(expression: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            expression: Some(expression.into()),
            help: Some(
                "No value is available for this reference. Provide a fallback value \
                 (e.g. ${env:NAME, \"default\"}) or make the referenced value available"
                    .into(),
            ),
            ..Self::new(ErrorKind::Resolver(ResolverErrorKind::CannotResolve))
        }
    }

    /// Create a type mismatch error for a non-string value inside a string template
    pub fn non_string_template(
        path: impl Into<String>,
        expression: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            path: Some(path.into()),
            expression: Some(expression.into()),
            help: Some(
                "Only strings, numbers and booleans can be embedded in a larger string; \
                 use the placeholder as the entire value instead"
                    .into(),
            ),
            ..Self::new(ErrorKind::NonStringTemplate {
                type_name: type_name.into(),
            })
        }
    }

    /// Create a credential configuration conflict error
    pub fn credential_conflict() -> Self {
        Self {
            path: Some("provider".into()),
            help: Some("Set only one of provider.profile or provider.resolver".into()),
            ..Self::new(ErrorKind::CredentialConflict)
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self {
            cause: Some(message.into()),
            ..Self::new(ErrorKind::Configuration)
        }
    }

    /// Create a path not found error
    pub fn path_not_found(path: impl Into<String>) -> Self {
        let path_str = path.into();
        Self {
            help: Some(format!("Check that '{}' exists in the document", path_str)),
            path: Some(path_str),
            ..Self::new(ErrorKind::PathNotFound)
        }
    }

    /// Create an I/O error
    pub fn io(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_location: Some(SourceLocation {
                file: file.into(),
                line: None,
                column: None,
            }),
            cause: Some(message.into()),
            ..Self::new(ErrorKind::Io)
        }
    }

    /// Create an internal error (bug in vargraph)
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            help: Some("This is likely a bug in vargraph. Please report it.".into()),
            cause: Some(message.into()),
            ..Self::new(ErrorKind::Internal)
        }
    }

    /// Add path context to the error
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Add path context unless the error already carries one
    pub fn or_path(mut self, path: impl Into<String>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    /// Attach the original placeholder text unless one is already set
    pub fn or_expression(mut self, expression: impl Into<String>) -> Self {
        if self.expression.is_none() {
            self.expression = Some(expression.into());
        }
        self
    }

    /// Add source location to the error
    pub fn with_source_location(mut self, loc: SourceLocation) -> Self {
        self.source_location = Some(loc);
        self
    }

    /// Add help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// True when every candidate of a placeholder came back missing
    pub fn is_unresolvable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Resolver(ResolverErrorKind::CannotResolve)
        )
    }

    /// True for provider or resolver lookup failures
    pub fn is_lookup_failure(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Resolver(ResolverErrorKind::ProviderNotFound { .. })
                | ErrorKind::Resolver(ResolverErrorKind::ResolverNotFound { .. })
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Parse => write!(f, "Parse error")?,
            ErrorKind::Syntax => write!(f, "Invalid variable syntax")?,
            ErrorKind::CyclicReference => write!(f, "Cyclic reference found")?,
            ErrorKind::Resolver(r) => match r {
                ResolverErrorKind::ProviderNotFound { provider } => {
                    write!(f, "Provider not found: {}", provider)?
                }
                ResolverErrorKind::ResolverNotFound { provider, resolver } => write!(
                    f,
                    "{} resolver of provider {} not found",
                    resolver, provider
                )?,
                ResolverErrorKind::Failed {
                    provider,
                    resolver,
                    key,
                    message,
                } => write!(
                    f,
                    "Failed to resolve variable '{}' with resolver '{}' and provider '{}': {}",
                    key, resolver, provider, message
                )?,
                ResolverErrorKind::CannotResolve => write!(f, "Cannot resolve variable")?,
            },
            ErrorKind::NonStringTemplate { type_name } => write!(
                f,
                "String value consists of a variable which resolves to a non-string value ({})",
                type_name
            )?,
            ErrorKind::CredentialConflict => write!(
                f,
                "You cannot specify both 'profile' and 'resolver' in the provider block"
            )?,
            ErrorKind::Configuration => write!(f, "Configuration error")?,
            ErrorKind::PathNotFound => write!(f, "Path not found")?,
            ErrorKind::Io => write!(f, "I/O error")?,
            ErrorKind::Internal => write!(f, "Internal error")?,
        }

        if let Some(expr) = &self.expression {
            write!(f, "\n  Expression: {}", expr)?;
        }

        if let Some(path) = &self.path {
            write!(f, "\n  Path: {}", path)?;
        }

        if let Some(loc) = &self.source_location {
            write!(f, "\n  File: {}", loc.file)?;
            if let Some(line) = loc.line {
                write!(f, ":{}", line)?;
            }
        }

        if let Some(cause) = &self.cause {
            write!(f, "\n  {}", cause)?;
        }

        if let Some(help) = &self.help {
            write!(f, "\n  Help: {}", help)?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        let loc = err.location();
        let mut e = Error::parse(err.to_string());
        if let Some(loc) = loc {
            e = e.with_source_location(SourceLocation {
                file: "<yaml>".into(),
                line: Some(loc.line()),
                column: Some(loc.column()),
            });
        }
        e
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::parse(err.to_string()).with_source_location(SourceLocation {
            file: "<json>".into(),
            line: Some(err.line()),
            column: Some(err.column()),
        })
    }
}
