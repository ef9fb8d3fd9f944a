use std::io::Read;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::alarm::model::{Alarm, WeekDays};
use crate::alarm::queue::{ControlCommand, LightAction};
use crate::error::CommandError;
use crate::remote::Remote;

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

pub struct ApiServer {
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

struct ApiContext {
    name: String,
    remote: Remote,
}

impl ApiServer {
    pub fn start(config: ApiServerConfig, name: String, remote: Remote) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start HTTP server on {bind}: {err}"))?;
        info!("HTTP server listening on {bind}");
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let context = ApiContext { name, remote };
        let http_join = thread::Builder::new()
            .name("http".to_string())
            .spawn(move || run_server_loop(server, context, stop_for_thread))
            .context("unable to start HTTP server thread")?;

        Ok(Self {
            stop,
            http_join: Some(http_join),
        })
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

fn run_server_loop(server: Server, context: ApiContext, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => {
                if let Err(err) = handle_request(request, &context) {
                    warn!("HTTP response failed: {err:#}");
                }
            }
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

/// Alarm as exchanged with HTTP clients. `id` 0 in an update creates a new
/// alarm from the configured defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmDocument {
    #[serde(default)]
    pub id: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub one_time_only: bool,
    #[serde(default)]
    pub skip_once: bool,
    #[serde(with = "hour_minute")]
    pub time: NaiveTime,
    #[serde(default)]
    pub week_days: WeekDays,
    #[serde(default)]
    pub sound_id: Option<usize>,
    #[serde(default)]
    pub light_ids: Vec<u32>,
}

impl AlarmDocument {
    fn apply_to(&self, alarm: &mut Alarm) {
        alarm.enabled = self.enabled;
        alarm.one_time_only = self.one_time_only;
        alarm.skip_once = self.skip_once;
        alarm.time = self.time;
        alarm.week_days = self.week_days;
        alarm.sound_id = self.sound_id;
        alarm.light_ids = self.light_ids.clone();
    }
}

impl From<&Alarm> for AlarmDocument {
    fn from(alarm: &Alarm) -> Self {
        Self {
            id: alarm.id,
            enabled: alarm.enabled,
            one_time_only: alarm.one_time_only,
            skip_once: alarm.skip_once,
            time: alarm.time,
            week_days: alarm.week_days,
            sound_id: alarm.sound_id,
            light_ids: alarm.light_ids.clone(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightDocument {
    pub id: u32,
    pub name: String,
    pub brightness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateDocument {
    pub name: String,
    pub alarms: Vec<AlarmDocument>,
    pub lights: Vec<LightDocument>,
}

/// Body of `POST /v1/alarms`. Without week days the alarm fires once.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewAlarm {
    #[serde(with = "hour_minute")]
    time: NaiveTime,
    #[serde(default)]
    week_days: WeekDays,
    #[serde(default)]
    sound_id: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CreatedAlarm {
    id: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct StateUpdate {
    #[serde(default)]
    pub alarms: Vec<AlarmDocument>,
    #[serde(default)]
    pub lights: Vec<LightUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct LightUpdate {
    pub id: u32,
    pub brightness: f64,
}

pub fn build_document(name: &str, remote: &Remote) -> StateDocument {
    StateDocument {
        name: name.to_string(),
        alarms: remote
            .store()
            .list()
            .iter()
            .map(AlarmDocument::from)
            .collect(),
        lights: remote
            .get_light_control_list()
            .into_iter()
            .map(|light| LightDocument {
                id: light.id,
                name: light.name,
                brightness: light.brightness,
            })
            .collect(),
    }
}

/// Applies an update atomically: every alarm is replaced inside one
/// transaction, light changes are queued only once the alarms committed.
/// Returns the ids of the written alarms.
pub fn apply_update(remote: &Remote, update: &StateUpdate) -> Result<Vec<u32>, CommandError> {
    let known_lights = remote.get_light_control_list();
    let mut light_commands = Vec::with_capacity(update.lights.len());
    for light in &update.lights {
        if !known_lights.iter().any(|known| known.id == light.id) {
            return Err(CommandError::validation(format!(
                "unknown light {}",
                light.id
            )));
        }
        if !(0.0..=100.0).contains(&light.brightness) {
            return Err(CommandError::validation(format!(
                "brightness of light {} must be between 0 and 100",
                light.id
            )));
        }
        light_commands.push(ControlCommand::Light {
            id: light.id,
            action: LightAction::Brightness(light.brightness.round() as u8),
        });
    }

    let mut written = Vec::with_capacity(update.alarms.len());
    if !update.alarms.is_empty() {
        let store = remote.store();
        let mut tx = store.begin_transaction();
        for document in &update.alarms {
            let id = if document.id == 0 {
                let id = tx.next_id();
                tx.insert(Alarm {
                    id,
                    ..store.template().clone()
                });
                id
            } else {
                document.id
            };
            document.apply_to(tx.alarm_mut(id)?);
            written.push(id);
        }
        tx.commit()?;
    }

    for command in light_commands {
        remote.command(command);
    }
    Ok(written)
}

fn handle_request(mut request: tiny_http::Request, context: &ApiContext) -> Result<()> {
    let Some(remote_addr) = request.remote_addr() else {
        return send_text(request, StatusCode(400), "missing remote address");
    };
    if !is_local_network_ip(remote_addr.ip()) {
        return send_text(request, StatusCode(403), "forbidden: local network only");
    }

    let url = request.url().to_string();
    let (path, _query) = split_path_query(&url);
    debug!("HTTP {} {path}", request.method());

    match (request.method().clone(), path) {
        (Method::Get, "/" | "/v1/state") => send_json(
            request,
            StatusCode(200),
            &build_document(&context.name, &context.remote),
        ),
        (Method::Post, "/" | "/v1/state") => {
            let body = match read_body(&mut request) {
                Ok(body) => body,
                Err(message) => return send_text(request, StatusCode(400), &message),
            };
            let update = match parse_json::<StateUpdate>(&body) {
                Ok(update) => update,
                Err(message) => return send_text(request, StatusCode(400), &message),
            };
            match apply_update(&context.remote, &update) {
                Ok(written) => {
                    info!("HTTP update wrote alarms {written:?}");
                    send_json(
                        request,
                        StatusCode(200),
                        &build_document(&context.name, &context.remote),
                    )
                }
                Err(err) => send_text(request, StatusCode(400), &err.to_string()),
            }
        }
        (Method::Post, "/v1/stop") => {
            context.remote.stop_active_alarm();
            send_text(request, StatusCode(200), "stopping active alarms")
        }
        (Method::Post, "/v1/off") => {
            context.remote.all_off(false);
            send_text(request, StatusCode(200), "switching everything off")
        }
        (Method::Post, "/v1/alarms") => {
            let body = match read_body(&mut request) {
                Ok(body) => body,
                Err(message) => return send_text(request, StatusCode(400), &message),
            };
            let document = match parse_json::<NewAlarm>(&body) {
                Ok(document) => document,
                Err(message) => return send_text(request, StatusCode(400), &message),
            };
            match context
                .remote
                .create_alarm(document.week_days, document.time, document.sound_id)
            {
                Ok(id) => send_json(request, StatusCode(201), &CreatedAlarm { id }),
                Err(err) => send_text(request, StatusCode(400), &err.to_string()),
            }
        }
        (Method::Get, path) if path.starts_with("/v1/alarms/") => {
            match parse_alarm_path(path).and_then(|id| context.remote.get_alarm(id)) {
                Some(alarm) => send_json(request, StatusCode(200), &AlarmDocument::from(&alarm)),
                None => send_text(request, StatusCode(404), "unknown alarm"),
            }
        }
        (Method::Post, path) if path.starts_with("/v1/alarms/") && path.ends_with("/process") => {
            let id = path
                .strip_suffix("/process")
                .and_then(parse_alarm_path)
                .filter(|id| context.remote.get_alarm(*id).is_some());
            let Some(id) = id else {
                return send_text(request, StatusCode(404), "unknown alarm");
            };
            context.remote.add_alarm_to_process(id);
            send_text(request, StatusCode(200), &format!("alarm {id} queued"))
        }
        (Method::Delete, path) if path.starts_with("/v1/alarms/") => {
            let Some(id) = parse_alarm_path(path) else {
                return send_text(request, StatusCode(400), "invalid alarm id");
            };
            match context.remote.remove_alarm_from_list(id) {
                Ok(_) => send_text(request, StatusCode(200), &format!("removed alarm {id}")),
                Err(err) => send_text(request, StatusCode(404), &err.to_string()),
            }
        }
        (_, "/" | "/v1/state" | "/v1/stop" | "/v1/off" | "/v1/alarms") => {
            send_text(request, StatusCode(405), "method not allowed")
        }
        _ => send_text(request, StatusCode(404), "not found"),
    }
}

fn read_body(request: &mut tiny_http::Request) -> Result<String, String> {
    let mut body = String::new();
    request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
        .map_err(|err| format!("unreadable body: {err}"))?;
    Ok(body)
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, String> {
    serde_json::from_str(body).map_err(|err| {
        let line = err.line();
        let column = err.column();
        format!("invalid JSON at line {line}, column {column}: {err}")
    })
}

fn parse_alarm_path(path: &str) -> Option<u32> {
    path.strip_prefix("/v1/alarms/")?
        .trim_end_matches('/')
        .parse()
        .ok()
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = Header::from_str("Content-Type: text/plain; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_string(body.to_string())
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}

/// `HH:MM` on output; `HH:MM` or `HH:MM:SS` on input.
mod hour_minute {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&text, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&text, "%H:%M:%S"))
            .map_err(|_| de::Error::custom(format!("invalid time '{text}', expected HH:MM")))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use chrono::{Local, Weekday};

    use super::*;
    use crate::remote::testing::harness;

    fn seven() -> NaiveTime {
        NaiveTime::from_hms_opt(7, 0, 0).expect("time")
    }

    #[test]
    fn local_network_ip_filter_accepts_private_and_loopback() {
        assert!(is_local_network_ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_local_network_ip(IpAddr::V4(Ipv4Addr::new(
            192, 168, 1, 44
        ))));
        assert!(is_local_network_ip(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert!(is_local_network_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_local_network_ip(IpAddr::V6(Ipv6Addr::new(
            0xfc00, 0, 0, 0, 0, 0, 0, 1
        ))));
        assert!(!is_local_network_ip(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn document_serializes_week_days_as_names() {
        let harness = harness();
        let days = [Weekday::Wed, Weekday::Mon].into_iter().collect::<WeekDays>();
        let id = harness
            .remote
            .create_alarm(days, seven(), Some(2))
            .expect("create");

        let document = build_document("bedroom", &harness.remote);
        let json = serde_json::to_value(&document).expect("serialize");
        assert_eq!(json["name"], "bedroom");
        let alarm = &json["alarms"][0];
        assert_eq!(alarm["id"], id);
        assert_eq!(alarm["time"], "07:00");
        assert_eq!(alarm["soundId"], 2);
        assert_eq!(alarm["oneTimeOnly"], false);
        assert_eq!(alarm["weekDays"], serde_json::json!(["MONDAY", "WEDNESDAY"]));
        assert_eq!(json["lights"].as_array().map(Vec::len), Some(2));

        let reimported =
            serde_json::from_value::<AlarmDocument>(alarm.clone()).expect("re-import");
        assert_eq!(reimported.week_days, days);
        assert_eq!(reimported.time, seven());
    }

    #[test]
    fn update_replaces_alarm_fields() {
        let harness = harness();
        let id = harness
            .remote
            .create_alarm(WeekDays::all(), seven(), None)
            .expect("create");
        let update = serde_json::from_str::<StateUpdate>(&format!(
            r#"{{"alarms": [{{"id": {id}, "enabled": false, "skipOnce": true,
                "time": "06:45", "weekDays": ["SATURDAY"], "soundId": 1}}]}}"#
        ))
        .expect("update json");

        assert_eq!(apply_update(&harness.remote, &update), Ok(vec![id]));
        let alarm = harness.remote.get_alarm(id).expect("alarm");
        assert!(!alarm.enabled);
        assert!(alarm.skip_once);
        assert_eq!(alarm.time, NaiveTime::from_hms_opt(6, 45, 0).expect("time"));
        assert_eq!(alarm.week_days, [Weekday::Sat].into_iter().collect::<WeekDays>());
        assert_eq!(alarm.sound_id, Some(1));
    }

    #[test]
    fn update_with_unknown_alarm_changes_nothing() {
        let harness = harness();
        let id = harness
            .remote
            .create_alarm(WeekDays::all(), seven(), None)
            .expect("create");
        let before = harness.remote.store().list();
        let update = serde_json::from_str::<StateUpdate>(&format!(
            r#"{{"alarms": [
                {{"id": {id}, "time": "05:00", "weekDays": ["MONDAY"]}},
                {{"id": 99, "time": "05:00", "weekDays": ["MONDAY"]}}
            ]}}"#
        ))
        .expect("update json");

        let err = apply_update(&harness.remote, &update).expect_err("unknown id");
        assert_eq!(err, CommandError::validation("unknown alarm id 99"));
        assert_eq!(harness.remote.store().list(), before);
    }

    #[test]
    fn update_with_id_zero_creates_alarm() {
        let harness = harness();
        let update = serde_json::from_str::<StateUpdate>(
            r#"{"alarms": [{"time": "08:15", "oneTimeOnly": true}]}"#,
        )
        .expect("update json");
        let written = apply_update(&harness.remote, &update).expect("apply");
        assert_eq!(written, vec![1]);
        let alarm = harness.remote.get_alarm(1).expect("created");
        assert!(alarm.one_time_only);
        assert!(alarm.enabled);
        assert_eq!(alarm.duration, harness.remote.store().template().duration);
    }

    #[test]
    fn recurring_alarm_without_days_is_rejected() {
        let harness = harness();
        let update = serde_json::from_str::<StateUpdate>(r#"{"alarms": [{"time": "08:15"}]}"#)
            .expect("update json");
        assert!(apply_update(&harness.remote, &update).is_err());
        assert!(harness.remote.store().list().is_empty());
    }

    #[test]
    fn light_updates_are_validated_then_queued() {
        let mut harness = harness();
        let bad = serde_json::from_str::<StateUpdate>(r#"{"lights": [{"id": 4, "brightness": 120}]}"#)
            .expect("update json");
        assert!(apply_update(&harness.remote, &bad).is_err());
        let unknown = serde_json::from_str::<StateUpdate>(r#"{"lights": [{"id": 9, "brightness": 10}]}"#)
            .expect("update json");
        assert!(apply_update(&harness.remote, &unknown).is_err());

        let good = serde_json::from_str::<StateUpdate>(r#"{"lights": [{"id": 4, "brightness": 62.4}]}"#)
            .expect("update json");
        apply_update(&harness.remote, &good).expect("apply");
        harness.controller.tick(Local::now());
        assert_eq!(harness.lights.calls().len(), 1);
        assert_eq!(harness.lights.last_brightness(4), Some(62.0));
        let document = build_document("bedroom", &harness.remote);
        assert_eq!(document.lights[1].brightness, 62.0);
    }

    #[test]
    fn time_accepts_seconds_on_input() {
        let document = serde_json::from_str::<AlarmDocument>(
            r#"{"id": 3, "time": "06:30:00", "weekDays": ["SUNDAY"]}"#,
        )
        .expect("document");
        assert_eq!(document.time, NaiveTime::from_hms_opt(6, 30, 0).expect("time"));
        assert!(serde_json::from_str::<AlarmDocument>(r#"{"time": "6.30"}"#).is_err());
    }

    #[test]
    fn new_alarm_body_defaults_to_one_time() {
        let body = parse_json::<NewAlarm>(r#"{"time": "06:10"}"#).expect("body");
        assert!(body.week_days.is_empty());
        assert_eq!(body.sound_id, None);
        let err = parse_json::<NewAlarm>("{").expect_err("truncated body");
        assert!(err.starts_with("invalid JSON at line 1"));
    }

    #[test]
    fn alarm_paths_carry_numeric_ids() {
        assert_eq!(parse_alarm_path("/v1/alarms/12"), Some(12));
        assert_eq!(parse_alarm_path("/v1/alarms/12/"), Some(12));
        assert_eq!(parse_alarm_path("/v1/alarms/x"), None);
        assert_eq!(split_path_query("/v1/state?x=1"), ("/v1/state", "x=1"));
    }
}
