//! # GPX Encoding
//!
//! Converts an [`Activity`] into a GPX 1.1 document.
//!
//! Output is a pure function of the activity: the same activity always
//! produces byte-identical files, so re-uploading after a crash overwrites
//! the earlier copy with identical content.

use std::borrow::Cow;
use std::fmt::Write;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Result, SyncError};
use crate::{Activity, TrackPoint};

const CREATOR: &str = "activity-sync";
const GPX_NS: &str = "http://www.topografix.com/GPX/1.1";
const TPX_NS: &str = "http://www.garmin.com/xmlschemas/TrackPointExtension/v1";
const SCHEMA_LOCATION: &str = "http://www.topografix.com/GPX/1.1 \
    http://www.topografix.com/GPX/1.1/gpx.xsd \
    http://www.garmin.com/xmlschemas/TrackPointExtension/v1 \
    http://www.garmin.com/xmlschemas/TrackPointExtensionv1.xsd";

/// An encoded route file, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFile {
    /// Deterministic file name, e.g. `2024-06-01_Morning_Ride.gpx`
    pub file_name: String,
    pub content: Vec<u8>,
}

impl EncodedFile {
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Encode an activity as GPX.
///
/// Fails with `SyncError::Encoding` when the activity has no track points or
/// a point with invalid coordinates.
pub fn encode(activity: &Activity) -> Result<EncodedFile> {
    validate(activity)?;

    let mut xml = String::with_capacity(512 + activity.track.len() * 160);
    render(&mut xml, activity)?;

    Ok(EncodedFile {
        file_name: file_name(activity),
        content: xml.into_bytes(),
    })
}

/// `{UTC start date}_{name}.gpx`, with path separators and spaces replaced.
pub fn file_name(activity: &Activity) -> String {
    let name = activity.name.trim();
    let safe_name: String = if name.is_empty() {
        format!("activity-{}", activity.id)
    } else {
        name.chars()
            .map(|c| match c {
                ' ' => '_',
                '/' | '\\' => '-',
                c if c.is_control() => '_',
                c => c,
            })
            .collect()
    };
    format!("{}_{}.gpx", activity.start.format("%Y-%m-%d"), safe_name)
}

fn validate(activity: &Activity) -> Result<()> {
    if activity.track.is_empty() {
        return Err(SyncError::encoding(
            &activity.id,
            "activity has no track points",
        ));
    }
    if let Some((i, _)) = activity
        .track
        .iter()
        .enumerate()
        .find(|(_, p)| !p.is_valid())
    {
        return Err(SyncError::encoding(
            &activity.id,
            format!("track point {} has invalid coordinates", i),
        ));
    }
    Ok(())
}

fn render<W: Write>(out: &mut W, activity: &Activity) -> Result<()> {
    write_document(out, activity)
        .map_err(|e| SyncError::encoding(&activity.id, format!("writing GPX: {}", e)))
}

fn write_document<W: Write>(out: &mut W, activity: &Activity) -> std::fmt::Result {
    let name = escape(&activity.name);

    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(
        out,
        r#"<gpx xmlns="{GPX_NS}" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:schemaLocation="{SCHEMA_LOCATION}" xmlns:gpxtpx="{TPX_NS}" creator="{CREATOR}" version="1.1">"#
    )?;
    writeln!(out, "  <metadata>")?;
    writeln!(out, "    <name>{}</name>", name)?;
    writeln!(out, "    <time>{}</time>", timestamp(activity.start))?;
    writeln!(out, "  </metadata>")?;
    writeln!(out, "  <trk>")?;
    writeln!(out, "    <name>{}</name>", name)?;
    writeln!(out, "    <desc>{}</desc>", escape(&activity.sport_type))?;
    writeln!(out, "    <type>{}</type>", escape(&activity.activity_type))?;
    writeln!(out, "    <trkseg>")?;
    for point in &activity.track {
        write_point(out, point)?;
    }
    writeln!(out, "    </trkseg>")?;
    writeln!(out, "  </trk>")?;
    writeln!(out, "</gpx>")
}

fn write_point<W: Write>(out: &mut W, point: &TrackPoint) -> std::fmt::Result {
    writeln!(
        out,
        r#"      <trkpt lat="{:.7}" lon="{:.7}">"#,
        point.latitude, point.longitude
    )?;
    if let Some(ele) = point.elevation {
        writeln!(out, "        <ele>{:.1}</ele>", ele)?;
    }
    writeln!(out, "        <time>{}</time>", timestamp(point.time))?;

    let has_tpx =
        point.temperature.is_some() || point.heart_rate.is_some() || point.cadence.is_some();
    if has_tpx || point.power.is_some() {
        writeln!(out, "        <extensions>")?;
        if let Some(power) = point.power {
            writeln!(out, "          <power>{}</power>", power)?;
        }
        if has_tpx {
            // Schema order: atemp, hr, cad
            writeln!(out, "          <gpxtpx:TrackPointExtension>")?;
            if let Some(temp) = point.temperature {
                writeln!(out, "            <gpxtpx:atemp>{:.1}</gpxtpx:atemp>", temp)?;
            }
            if let Some(hr) = point.heart_rate {
                writeln!(out, "            <gpxtpx:hr>{}</gpxtpx:hr>", hr)?;
            }
            if let Some(cad) = point.cadence {
                writeln!(out, "            <gpxtpx:cad>{}</gpxtpx:cad>", cad)?;
            }
            writeln!(out, "          </gpxtpx:TrackPointExtension>")?;
        }
        writeln!(out, "        </extensions>")?;
    }
    writeln!(out, "      </trkpt>")
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn escape(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(s);
    }
    let mut escaped = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}
