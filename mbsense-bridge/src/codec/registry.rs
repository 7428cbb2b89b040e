//! Codec registry: formats grouped by provider, resolved by uri.

use tracing::debug;

use super::{FormatRef, builtin, king_pigeon, r4dcb08, raymarine};
use crate::error::{Error, Result};

const PLUGIN_SCHEME: &str = "plugin://";

struct Provider {
    uid: String,
    formats: Vec<FormatRef>,
}

/// Append-only table of codec providers.
///
/// Built once at startup and handed by reference to everything that binds
/// sensors to codecs.
#[derive(Default)]
pub struct CodecRegistry {
    providers: Vec<Provider>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in codecs only.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.providers.push(Provider {
            uid: builtin::PROVIDER.to_string(),
            formats: builtin::formats(),
        });
        registry
    }

    /// Built-in codecs plus the bundled vendor providers named in
    /// `selection`, or all of them when `selection` is `None`.
    pub fn bundled(selection: Option<&[String]>) -> Result<Self> {
        let mut registry = Self::with_builtin();
        let bundled: [(&str, fn() -> Vec<FormatRef>); 3] = [
            (king_pigeon::PROVIDER, king_pigeon::formats),
            (raymarine::PROVIDER, raymarine::formats),
            (r4dcb08::PROVIDER, r4dcb08::formats),
        ];

        match selection {
            None => {
                for (uid, formats) in bundled {
                    registry.register(uid, formats())?;
                }
            }
            Some(names) => {
                for name in names {
                    let (uid, formats) = bundled
                        .iter()
                        .find(|(uid, _)| uid.eq_ignore_ascii_case(name))
                        .ok_or_else(|| {
                            Error::Lookup(format!("unknown codec provider '{}'", name))
                        })?;
                    registry.register(uid, formats())?;
                }
            }
        }
        Ok(registry)
    }

    /// Add `formats` under `provider`.
    ///
    /// Registering a format id the provider already has is a configuration
    /// error; nothing is added in that case.
    pub fn register(&mut self, provider: &str, formats: Vec<FormatRef>) -> Result<()> {
        let index = self.find_provider(provider);
        let existing = index.map(|i| self.providers[i].formats.as_slice()).unwrap_or_default();
        for (i, format) in formats.iter().enumerate() {
            let clash = existing
                .iter()
                .chain(&formats[..i])
                .any(|f| f.uid().eq_ignore_ascii_case(format.uid()));
            if clash {
                return Err(Error::Config(format!(
                    "codec '{}' registered twice for provider '{}'",
                    format.uid(),
                    provider
                )));
            }
        }

        debug!(
            provider,
            formats = ?formats.iter().map(|f| f.uid().to_string()).collect::<Vec<_>>(),
            "Registered codecs"
        );
        match index {
            Some(i) => self.providers[i].formats.extend(formats),
            None => self.providers.push(Provider {
                uid: provider.to_string(),
                formats,
            }),
        }
        Ok(())
    }

    /// Find a format by uri: a bare format id for the built-in codecs, or
    /// `plugin://<provider>#<format>`.
    pub fn resolve(&self, uri: &str) -> Result<FormatRef> {
        let (provider, format) = parse_uri(uri)?;
        let index = self
            .find_provider(provider)
            .ok_or_else(|| Error::Lookup(format!("no codec provider '{}'", provider)))?;
        self.providers[index]
            .formats
            .iter()
            .find(|f| f.uid().eq_ignore_ascii_case(format))
            .cloned()
            .ok_or_else(|| Error::Lookup(format!("no codec '{}'", uri)))
    }

    /// Registered provider ids, in registration order.
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.uid.as_str())
    }

    fn find_provider(&self, uid: &str) -> Option<usize> {
        self.providers
            .iter()
            .position(|p| p.uid.eq_ignore_ascii_case(uid))
    }
}

/// Split a codec uri into provider and format ids.
fn parse_uri(uri: &str) -> Result<(&str, &str)> {
    let is_plugin = uri
        .get(..PLUGIN_SCHEME.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(PLUGIN_SCHEME));
    if !is_plugin {
        return Ok((builtin::PROVIDER, uri));
    }

    let rest = &uri[PLUGIN_SCHEME.len()..];
    let (provider, format) = rest
        .split_once('#')
        .ok_or_else(|| Error::Parse(format!("codec uri '{}' lacks '#'", uri)))?;
    if provider.is_empty() {
        return Err(Error::Parse(format!("codec uri '{}' has no provider", uri)));
    }
    Ok((provider, format))
}
