use crate::backup::archive::{ArchiveEntry, ArchivePrefix, SourceRoot};
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithFnName, WithMsg};

use bon::Builder;
use derive_more::{Display, From};
use dyn_iter::{DynIter, IntoDynIterator};
use function_name::named;
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use walkdir::{DirEntry, WalkDir};

use std::fmt::Formatter;
use std::path::Path;
use std::result;

/// A glob pattern wrapper that handles custom deserialization
///
/// Wraps the `globset::Glob` type with custom serde support for
/// deserializing glob patterns from config strings. Automatically
/// enables literal separator mode for consistent path matching.
#[derive(Clone, Debug, From, Display, Serialize, Builder, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct CustomDeserializedGlob {
    #[builder(into)]
    glob: Glob,
}

struct CustomGlobVisitor;

impl Visitor<'_> for CustomGlobVisitor {
    type Value = CustomDeserializedGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        GlobBuilder::new(v)
            .literal_separator(true)
            .build()
            .map(CustomDeserializedGlob::from)
            .map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for CustomDeserializedGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(CustomGlobVisitor)
    }
}

/// Exclude set compiled from a game's glob list; matches nothing when the
/// list is empty.
pub fn build_exclude_set(globs: &[CustomDeserializedGlob]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for g in globs {
        builder.add(g.glob().clone());
    }
    Ok(builder.build()?)
}

/// Walks one source root into archive entries named `<prefix>/<relative>`,
/// dropping files matched by the exclude set.
#[named]
pub fn source_entries(
    source: &SourceRoot,
    exclude: &GlobSet,
) -> Result<DynIter<'static, Result<ArchiveEntry>>> {
    if !source.dir.is_dir() {
        tracing::error!(
            "Source directory does not exist or is not a directory: {:?}",
            source.dir
        );
        return Err(Error::from(std::io::Error::other(
            "source dir is not a directory",
        )));
    }

    tracing::debug!(
        "Scanning {:?} for {} entries with {} exclude patterns",
        source.dir,
        source.prefix.as_str(),
        exclude.len()
    );

    let prefix = source.prefix;
    let base_dir = source.dir.clone();
    let exclude = exclude.clone();

    let entries = WalkDir::new(&source.dir)
        .follow_links(true)
        .into_iter()
        .filter_map(move |res| match res {
            Ok(de) => process_dir_entry(de, &base_dir, prefix, &exclude),
            Err(e) => Some(Err(e.into())),
        })
        .map(move |res| res.with_fn_name(function_path!()));

    Ok(entries.into_dyn_iter())
}

fn process_dir_entry(
    de: DirEntry,
    base_dir: &Path,
    prefix: ArchivePrefix,
    exclude: &GlobSet,
) -> Option<Result<ArchiveEntry>> {
    let p = de.into_path();
    if !p.is_file() {
        tracing::trace!("Skipping {:?} not a file", p);
        return None;
    }

    let res = match p.strip_prefix(base_dir) {
        Ok(stripped) => {
            if exclude.is_match(stripped) {
                tracing::trace!("Skipping {:?}, exclude glob match", p);
                return None;
            }
            Ok(entry_name(prefix, stripped))
        }
        Err(e) => Err(Error::from(std::io::Error::other(e))
            .with_msg(format!("Stripping {:?} from {:?} failed", base_dir, p))),
    };

    Some(res.map(|dst| {
        let entry = ArchiveEntry::new(p, dst);
        tracing::trace!("Including file: {:?} -> {:?}", entry.src, entry.dst);
        entry
    }))
}

/// Zip entry name for a file under its source root: the prefix plus the
/// relative path, joined with forward slashes regardless of platform.
fn entry_name(prefix: ArchivePrefix, relative: &Path) -> String {
    let mut name = String::from(prefix.as_str());
    for component in relative.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}
