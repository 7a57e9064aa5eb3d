use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};
use crate::fsutil::atomic_write_bytes;

/// Writes parameter values into the route file the simulator reads at launch.
///
/// A patch target is an element named after the parameter, carrying a `value`
/// attribute, found at `route[@id]/scenarios/scenario/<param>`. Everything
/// else in the document is streamed through untouched.
#[derive(Debug, Clone)]
pub struct ConfigPatcher {
    route_file: PathBuf,
    route_id: String,
}

impl ConfigPatcher {
    pub fn new(route_file: impl Into<PathBuf>, route_id: impl Into<String>) -> Self {
        Self {
            route_file: route_file.into(),
            route_id: route_id.into(),
        }
    }

    pub fn route_file(&self) -> &Path {
        &self.route_file
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn patch(&self, param: &str, value: f64) -> HarnessResult<()> {
        self.patch_many(&[(param, value)])
    }

    /// Patches every `(name, value)` pair in one read/write of the route file.
    /// Fails without writing if any name has no target on the route.
    pub fn patch_many(&self, values: &[(&str, f64)]) -> HarnessResult<()> {
        let xml = fs::read(&self.route_file)?;
        let names: Vec<&str> = values.iter().map(|(name, _)| *name).collect();
        let rendered: Vec<String> = values.iter().map(|(_, v)| format_value(*v)).collect();
        let (patched, hits) = rewrite_route(&xml, &self.route_id, &names, Some(&rendered))?;
        self.require_hits(&names, &hits)?;
        atomic_write_bytes(&self.route_file, &patched)?;
        debug!(
            route_id = %self.route_id,
            params = names.len(),
            "patched route file {}",
            self.route_file.display()
        );
        Ok(())
    }

    /// Checks that every name has at least one patch target, without writing.
    pub fn verify(&self, names: &[&str]) -> HarnessResult<()> {
        let xml = fs::read(&self.route_file)?;
        let (_, hits) = rewrite_route(&xml, &self.route_id, names, None)?;
        self.require_hits(names, &hits)
    }

    fn require_hits(&self, names: &[&str], hits: &[usize]) -> HarnessResult<()> {
        if let Some((name, _)) = names.iter().zip(hits).find(|(_, count)| **count == 0) {
            return Err(HarnessError::PatchNotFound {
                path: self.route_file.clone(),
                route_id: self.route_id.clone(),
                param: name.to_string(),
            });
        }
        Ok(())
    }
}

fn format_value(value: f64) -> String {
    format!("{}", value)
}

#[derive(Debug)]
struct Frame {
    name: Vec<u8>,
    matching_route: bool,
}

fn under_scenario(stack: &[Frame]) -> bool {
    let n = stack.len();
    n >= 3
        && stack[n - 3].matching_route
        && stack[n - 2].name == b"scenarios"
        && stack[n - 1].name == b"scenario"
}

fn is_matching_route(start: &BytesStart, route_id: &str) -> HarnessResult<bool> {
    if start.local_name().as_ref() != b"route" {
        return Ok(false);
    }
    match start
        .try_get_attribute("id")
        .map_err(quick_xml::Error::from)?
    {
        Some(attr) => Ok(attr.unescape_value()? == route_id),
        None => Ok(false),
    }
}

fn with_value(start: &BytesStart, value: &str) -> HarnessResult<Option<BytesStart<'static>>> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    let mut found = false;
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == b"value" {
            found = true;
            out.push_attribute(("value", value));
        } else {
            out.push_attribute(attr);
        }
    }
    Ok(found.then_some(out))
}

/// Streams `xml`, counting (and, when `values` is given, replacing) the
/// `value` attribute of each target element. Returns the rewritten document
/// and per-name hit counts aligned with `names`.
fn rewrite_route(
    xml: &[u8],
    route_id: &str,
    names: &[&str],
    values: Option<&[String]>,
) -> HarnessResult<(Vec<u8>, Vec<usize>)> {
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut stack: Vec<Frame> = Vec::new();
    let mut hits = vec![0usize; names.len()];
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(ref start) | Event::Empty(ref start) => {
                let is_empty = matches!(event, Event::Empty(_));
                let mut replacement = None;
                if under_scenario(&stack) {
                    let local = start.local_name();
                    if let Some(idx) = names.iter().position(|n| n.as_bytes() == local.as_ref()) {
                        let value = values.map(|v| v[idx].as_str()).unwrap_or_default();
                        if let Some(patched) = with_value(start, value)? {
                            hits[idx] += 1;
                            replacement = Some(patched);
                        }
                    }
                }
                if !is_empty {
                    stack.push(Frame {
                        name: start.local_name().as_ref().to_vec(),
                        matching_route: is_matching_route(start, route_id)?,
                    });
                }
                match (replacement, values.is_some()) {
                    (Some(patched), true) if is_empty => writer.write_event(Event::Empty(patched))?,
                    (Some(patched), true) => writer.write_event(Event::Start(patched))?,
                    _ => writer.write_event(event.borrow())?,
                }
            }
            Event::End(_) => {
                stack.pop();
                writer.write_event(event.borrow())?;
            }
            _ => writer.write_event(event.borrow())?,
        }
        drop(event);
        buf.clear();
    }
    Ok((writer.into_inner(), hits))
}
