//! OpenDocument text (`.odt`) support.
//!
//! A note links to a source with an ordinary hyperlink whose target is
//! `src:<hex>`; in `content.xml` that is a `text:a` element carrying an
//! `xlink:href` attribute. This module reads those targets, rewrites the
//! visible text of resolved links, and extracts plain text for previews.
//!
//! Only `content.xml` is ever parsed or rewritten. Every other archive entry
//! is copied raw, so `mimetype` stays first and stored.

use std::borrow::Cow;
use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::NoteError;

const CONTENT_XML: &str = "content.xml";
/// Maximum decompressed size of `content.xml` (zip-bomb protection).
const MAX_CONTENT_BYTES: u64 = 50 * 1024 * 1024;

const LINK_ELEMENT: &[u8] = b"text:a";
const HREF_ATTR: &[u8] = b"xlink:href";

/// Prefix of a hyperlink target that names a source by content hash.
pub const SRC_SCHEME: &str = "src:";

/// Whether `path` is a note document this crate knows how to parse.
pub fn is_note_document(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("odt"))
        .unwrap_or(false)
}

/// The lowercase hash named by a `src:<hex>` target, or `None` for any other
/// target form.
pub fn parse_src_target(href: &str) -> Option<String> {
    let hex = href.strip_prefix(SRC_SCHEME)?;
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(hex.to_ascii_lowercase())
}

/// Every distinct `src:` hash linked from the document, in document order.
pub fn extract_link_targets(document: &[u8]) -> Result<Vec<String>, NoteError> {
    let content = read_content(document)?;

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for href in link_hrefs(&content)? {
        if let Some(hash) = parse_src_target(&href) {
            if seen.insert(hash.clone()) {
                targets.push(hash);
            }
        }
    }
    Ok(targets)
}

/// Rewrite the document, replacing the visible text of every hyperlink for
/// which `resolve(href)` returns a value. Targets are never modified, and
/// links that do not resolve are written back untouched.
pub fn rewrite_links<F>(document: &[u8], resolve: F) -> Result<Vec<u8>, NoteError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut archive = ZipArchive::new(Cursor::new(document))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(document.len())));

    let mut found = false;
    for i in 0..archive.len() {
        let name = archive.by_index_raw(i)?.name().to_string();
        if name == CONTENT_XML {
            let content = read_bounded(archive.by_index(i)?)?;
            let rewritten = rewrite_content(&content, &resolve)?;
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            writer.start_file(name, options)?;
            writer.write_all(&rewritten)?;
            found = true;
        } else {
            writer.raw_copy_file(archive.by_index_raw(i)?)?;
        }
    }
    if !found {
        return Err(NoteError::MissingContent);
    }

    Ok(writer.finish()?.into_inner())
}

/// Plain text of the document body, one line per paragraph or heading.
pub fn extract_text(document: &[u8]) -> Result<String, NoteError> {
    let content = read_content(document)?;
    let mut reader = Reader::from_reader(content.as_slice());
    let mut buf = Vec::new();
    let mut out = String::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Text(t) => out.push_str(&t.unescape().map_err(xml_error)?),
            Event::End(e) if matches!(e.name().as_ref(), b"text:p" | b"text:h") => out.push('\n'),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn read_content(document: &[u8]) -> Result<Vec<u8>, NoteError> {
    let mut archive = ZipArchive::new(Cursor::new(document))?;
    let entry = archive.by_name(CONTENT_XML).map_err(|e| match e {
        ZipError::FileNotFound => NoteError::MissingContent,
        other => NoteError::Zip(other),
    })?;
    read_bounded(entry)
}

fn read_bounded(entry: impl Read) -> Result<Vec<u8>, NoteError> {
    let mut out = Vec::new();
    entry.take(MAX_CONTENT_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_CONTENT_BYTES {
        return Err(NoteError::TooLarge(MAX_CONTENT_BYTES));
    }
    Ok(out)
}

fn link_hrefs(content: &[u8]) -> Result<Vec<String>, NoteError> {
    let mut reader = Reader::from_reader(content);
    let mut buf = Vec::new();
    let mut hrefs = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == LINK_ELEMENT => {
                if let Some(href) = href_of(&e)? {
                    hrefs.push(href);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(hrefs)
}

fn rewrite_content<F>(content: &[u8], resolve: &F) -> Result<Vec<u8>, NoteError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut reader = Reader::from_reader(content);
    let mut writer = Writer::new(Vec::with_capacity(content.len()));
    let mut buf = Vec::new();
    let mut skipped = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(xml_error)?;
        match event {
            Event::Eof => break,
            Event::Start(e) if e.name().as_ref() == LINK_ELEMENT => {
                let start = e.into_owned();
                match replacement_for(&start, resolve)? {
                    Some(text) => {
                        // Drop the link's inner content up to its matching end tag.
                        reader
                            .read_to_end_into(start.name(), &mut skipped)
                            .map_err(xml_error)?;
                        skipped.clear();
                        write_link(&mut writer, &start, &text)?;
                    }
                    None => writer.write_event(Event::Start(start)).map_err(xml_error)?,
                }
            }
            Event::Empty(e) if e.name().as_ref() == LINK_ELEMENT => {
                let start = e.into_owned();
                match replacement_for(&start, resolve)? {
                    Some(text) => write_link(&mut writer, &start, &text)?,
                    None => writer.write_event(Event::Empty(start)).map_err(xml_error)?,
                }
            }
            other => writer.write_event(other).map_err(xml_error)?,
        }
        buf.clear();
    }

    Ok(writer.into_inner())
}

fn replacement_for<F>(start: &BytesStart<'_>, resolve: &F) -> Result<Option<String>, NoteError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(href_of(start)?.and_then(|href| resolve(&href)))
}

fn write_link(
    writer: &mut Writer<Vec<u8>>,
    start: &BytesStart<'_>,
    text: &str,
) -> Result<(), NoteError> {
    writer
        .write_event(Event::Start(start.borrow()))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(start.to_end()))
        .map_err(xml_error)?;
    Ok(())
}

fn href_of(element: &BytesStart<'_>) -> Result<Option<String>, NoteError> {
    let Some(attr) = element.try_get_attribute(HREF_ATTR).map_err(xml_error)? else {
        return Ok(None);
    };
    let value: Cow<'_, str> = attr.unescape_value().map_err(xml_error)?;
    Ok(Some(value.into_owned()))
}

fn xml_error(e: impl std::fmt::Display) -> NoteError {
    NoteError::Xml(e.to_string())
}
