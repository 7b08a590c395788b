//! HTML listing page

use anyhow::Result;
use handlebars::Handlebars;
use serde::Serialize;

use crate::attempt::LiftType;
use crate::session::{ClipEntry, ClipOrder, SessionEntry, SortDirection};
use crate::status::{StatusCode, StatusMessage};

const LISTING: &str = "listing";

#[derive(Debug, Serialize)]
pub struct SessionLink {
    pub name: String,
    pub url: String,
    pub selected: bool,
}

#[derive(Debug, Serialize)]
pub struct ClipRow {
    pub time: String,
    pub athlete: String,
    pub lift: String,
    pub attempt: u32,
    pub camera: u32,
    pub url: String,
}

/// Everything the listing template reads
#[derive(Debug, Default, Serialize)]
pub struct ListingData {
    pub session: Option<String>,
    pub sessions: Vec<SessionLink>,
    pub clips: Vec<ClipRow>,
    pub cameras: Vec<u32>,
    pub sort_time: String,
    pub sort_athlete_asc: String,
    pub sort_athlete_desc: String,
    pub sort_label: String,
    pub status_class: String,
    pub status_text: String,
}

impl ListingData {
    pub fn new(
        sessions: &[SessionEntry],
        selected: Option<&str>,
        clips: Vec<ClipEntry>,
        order: ClipOrder,
        cameras: u32,
        status: Option<StatusMessage>,
    ) -> Self {
        let link = |session: &str, query: &str| {
            format!("/?session={}{}", query_escape(session), query)
        };

        let (status_class, status_text) = match status {
            Some(msg) => (status_class(msg.code).to_string(), msg.text),
            None => ("done".to_string(), "Ready".to_string()),
        };

        let selected_name = selected.unwrap_or_default();
        Self {
            session: selected.map(str::to_string),
            sessions: sessions
                .iter()
                .map(|s| SessionLink {
                    name: s.name.replace('_', " "),
                    url: link(&s.name, ""),
                    selected: Some(s.name.as_str()) == selected,
                })
                .collect(),
            clips: clips.into_iter().map(ClipRow::from).collect(),
            cameras: (1..=cameras).collect(),
            sort_time: link(selected_name, "&sort=time"),
            sort_athlete_asc: link(selected_name, "&sort=athlete&order=asc"),
            sort_athlete_desc: link(selected_name, "&sort=athlete&order=desc"),
            sort_label: match order {
                ClipOrder::Newest => "newest first".to_string(),
                ClipOrder::Athlete(SortDirection::Asc) => "athlete, oldest first".to_string(),
                ClipOrder::Athlete(SortDirection::Desc) => "athlete, newest first".to_string(),
            },
            status_class,
            status_text,
        }
    }
}

impl From<ClipEntry> for ClipRow {
    fn from(clip: ClipEntry) -> Self {
        let lift = clip
            .lift
            .parse::<LiftType>()
            .map(|l| l.label().to_string())
            .unwrap_or_else(|_| clip.lift.clone());
        Self {
            time: clip.recorded_at.format("%H:%M:%S").to_string(),
            url: clip.url(),
            athlete: clip.athlete,
            lift,
            attempt: clip.attempt,
            camera: clip.camera,
        }
    }
}

fn status_class(code: StatusCode) -> &'static str {
    match code {
        StatusCode::Ready => "done",
        StatusCode::Recording => "recording",
        StatusCode::Trimming => "trimming",
        StatusCode::Error => "error",
    }
}

/// Percent-encode a query value
fn query_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Compiled listing template
pub struct ListingPage {
    templates: Handlebars<'static>,
}

impl ListingPage {
    pub fn new() -> Result<Self> {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(false);
        templates.register_template_string(LISTING, LISTING_HTML)?;
        Ok(Self { templates })
    }

    pub fn render(&self, data: &ListingData) -> Result<String, handlebars::RenderError> {
        self.templates.render(LISTING, data)
    }
}

const LISTING_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Jury replays{{#if session}} - {{session}}{{/if}}</title>
  <style>
    body { font-family: system-ui, sans-serif; margin: 1rem; background: #111; color: #eee; }
    a { color: #6cf; }
    header { display: flex; justify-content: space-between; align-items: center; }
    .status { padding: 0.4rem 0.8rem; border-radius: 4px; background: #333; }
    .status.recording { background: #a22; }
    .status.trimming { background: #a70; }
    .status.done { background: #264; }
    .status.error { background: #700; font-weight: bold; }
    nav a { margin-right: 0.8rem; }
    nav a.selected { font-weight: bold; text-decoration: none; }
    table { border-collapse: collapse; margin-top: 1rem; width: 100%; }
    th, td { text-align: left; padding: 0.3rem 0.6rem; border-bottom: 1px solid #333; }
  </style>
</head>
<body>
  <header>
    <h1>Jury replays</h1>
    <div id="status" class="status {{status_class}}">{{status_text}}</div>
  </header>
  <p class="replay">Latest:
    {{#each cameras}}<a href="/replay/{{this}}">Camera {{this}}</a> {{/each}}
  </p>
  <nav class="sessions">
    {{#each sessions}}<a href="{{this.url}}"{{#if this.selected}} class="selected"{{/if}}>{{this.name}}</a>{{/each}}
  </nav>
  {{#if session}}
  <p class="sort">Sorted {{sort_label}}:
    <a href="{{sort_time}}">time</a>
    <a href="{{sort_athlete_asc}}">athlete &uarr;</a>
    <a href="{{sort_athlete_desc}}">athlete &darr;</a>
  </p>
  <table>
    <thead><tr><th>Time</th><th>Athlete</th><th>Lift</th><th>Attempt</th><th>Camera</th></tr></thead>
    <tbody>
    {{#each clips}}
      <tr>
        <td>{{this.time}}</td>
        <td>{{this.athlete}}</td>
        <td>{{this.lift}}</td>
        <td>{{this.attempt}}</td>
        <td><a href="{{this.url}}">Camera {{this.camera}}</a></td>
      </tr>
    {{else}}
      <tr><td colspan="5">No replays yet</td></tr>
    {{/each}}
    </tbody>
  </table>
  {{else}}
  <p>No sessions recorded yet.</p>
  {{/if}}
  <script>
    const statusEl = document.getElementById('status');
    let clearTimer = null;

    function show(msg) {
      statusEl.className = 'status ' + (msg.code === 'DONE' ? 'done' : msg.code.toLowerCase());
      statusEl.textContent = msg.text;
      if (clearTimer) {
        clearTimeout(clearTimer);
        clearTimer = null;
      }
      if (msg.code === 'ERROR') {
        clearTimer = setTimeout(() => {
          statusEl.className = 'status done';
          statusEl.textContent = 'Ready';
        }, 10000);
      }
    }

    function connect() {
      const scheme = location.protocol === 'https:' ? 'wss://' : 'ws://';
      const ws = new WebSocket(scheme + location.host + '/ws');
      ws.onmessage = (event) => {
        const msg = JSON.parse(event.data);
        if (msg.text === 'reload') {
          location.reload();
          return;
        }
        show(msg);
      };
      ws.onclose = () => setTimeout(connect, 2000);
    }

    connect();
  </script>
</body>
</html>
"##;
