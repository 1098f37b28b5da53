//! Action table of the automation server.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::automation::{Automation, MouseButton};

const MAX_CLICKS: u32 = 10;

pub type Handler = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Action name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every host primitive of `automation`, plus `ping`.
    pub fn with_automation(automation: Arc<dyn Automation>) -> Self {
        let mut registry = Self::new();
        registry.register("ping", |_| Ok(json!({ "pong": true })));

        let a = Arc::clone(&automation);
        registry.register("mouse_move", move |p| {
            a.mouse_move(int(p, "x")?, int(p, "y")?)?;
            Ok(json!({}))
        });

        let a = Arc::clone(&automation);
        registry.register("mouse_click", move |p| {
            let at = match (opt_int(p, "x")?, opt_int(p, "y")?) {
                (Some(x), Some(y)) => Some((x, y)),
                _ => None,
            };
            let clicks = match p.get("clicks") {
                None | Some(Value::Null) => 1,
                Some(v) => v
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .filter(|n| (1..=MAX_CLICKS).contains(n))
                    .ok_or_else(|| anyhow!("clicks must be between 1 and {}", MAX_CLICKS))?,
            };
            a.mouse_click(at, button(p)?, clicks)?;
            Ok(json!({}))
        });

        let a = Arc::clone(&automation);
        registry.register("mouse_drag", move |p| {
            let from = (int(p, "start_x")?, int(p, "start_y")?);
            let to = (int(p, "end_x")?, int(p, "end_y")?);
            a.mouse_drag(from, to, button(p)?)?;
            Ok(json!({}))
        });

        let a = Arc::clone(&automation);
        registry.register("mouse_scroll", move |p| {
            a.mouse_scroll(int(p, "amount")?)?;
            Ok(json!({}))
        });

        let a = Arc::clone(&automation);
        registry.register("mouse_position", move |_| {
            let (x, y) = a.mouse_position()?;
            Ok(json!({ "x": x, "y": y }))
        });

        let a = Arc::clone(&automation);
        registry.register("keyboard_type", move |p| {
            let text = string(p, "text")?;
            if text.is_ascii() {
                a.keyboard_type(text)?;
                Ok(json!({ "method": "keys" }))
            } else {
                // Key synthesis cannot express arbitrary Unicode.
                a.clipboard_set(text)?;
                a.keyboard_hotkey(&["ctrl".to_string(), "v".to_string()])?;
                Ok(json!({ "method": "clipboard" }))
            }
        });

        let a = Arc::clone(&automation);
        registry.register("keyboard_press", move |p| {
            a.keyboard_press(string(p, "key")?)?;
            Ok(json!({}))
        });

        let a = Arc::clone(&automation);
        registry.register("keyboard_hotkey", move |p| {
            let keys: Vec<String> = p
                .get("keys")
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("Missing parameter: keys"))?
                .iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect();
            if keys.is_empty() {
                return Err(anyhow!("keys must not be empty"));
            }
            a.keyboard_hotkey(&keys)?;
            Ok(json!({}))
        });

        let a = Arc::clone(&automation);
        registry.register("screenshot", move |_| {
            let png = a.screenshot()?;
            Ok(json!({
                "format": "png",
                "image": base64::engine::general_purpose::STANDARD.encode(&png),
            }))
        });

        let a = Arc::clone(&automation);
        registry.register("clipboard_get", move |_| {
            Ok(json!({ "text": a.clipboard_get()? }))
        });

        let a = Arc::clone(&automation);
        registry.register("clipboard_set", move |p| {
            a.clipboard_set(string(p, "text")?)?;
            Ok(json!({}))
        });

        let a = Arc::clone(&automation);
        registry.register("window_list", move |_| {
            Ok(json!({ "windows": a.window_list()? }))
        });

        let a = Arc::clone(&automation);
        registry.register("window_find", move |p| {
            let needle = string(p, "title")?.to_lowercase();
            let windows: Vec<_> = a
                .window_list()?
                .into_iter()
                .filter(|w| w.title.to_lowercase().contains(&needle))
                .collect();
            Ok(json!({ "windows": windows }))
        });

        let a = Arc::clone(&automation);
        registry.register("launch", move |p| {
            let program = string(p, "program")?;
            let args: Vec<String> = p
                .get("args")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();

            if let Some(url) = std::iter::once(program)
                .chain(args.iter().map(String::as_str))
                .find(|s| looks_like_url(s))
            {
                a.open_url(url)?;
                return Ok(json!({ "opened": url }));
            }
            let pid = a.launch(program, &args)?;
            Ok(json!({ "pid": pid }))
        });

        let a = automation;
        registry.register("screen_size", move |_| {
            let (width, height) = a.screen_size()?;
            Ok(json!({ "width": width, "height": height }))
        });

        registry
    }

    pub fn register<F>(&mut self, action: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(action.into(), Arc::new(handler));
    }

    pub fn get(&self, action: &str) -> Option<Handler> {
        self.handlers.get(action).cloned()
    }

    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Schemes without `//` that still go to the default handler.
const OPAQUE_SCHEMES: &[&str] = &["mailto", "tel", "sms", "news", "magnet"];

/// `http(s)://`, `www.`, any other `scheme://` except `file`, or one of the
/// opaque schemes such as `mailto:`. `host:port` pairs and `remote:branch`
/// arguments are not URLs.
pub fn looks_like_url(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    if lower.starts_with("www.") {
        return true;
    }
    let parsed = match url::Url::parse(s) {
        Ok(parsed) => parsed,
        Err(_) => return false,
    };
    let scheme = parsed.scheme();
    // Drive letters like `C:\` parse as one-letter schemes.
    if scheme.len() < 2 || scheme == "file" {
        return false;
    }
    if OPAQUE_SCHEMES.contains(&scheme) {
        return true;
    }
    lower.starts_with(&format!("{}://", scheme))
}

fn int(p: &Value, key: &str) -> Result<i32> {
    opt_int(p, key)?.ok_or_else(|| anyhow!("Missing parameter: {}", key))
}

fn opt_int(p: &Value, key: &str) -> Result<Option<i32>> {
    match p.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_f64()
                .with_context(|| format!("Parameter {} must be a number", key))?
                .round();
            if !(f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&n) {
                return Err(anyhow!("Parameter {} is out of range", key));
            }
            Ok(Some(n as i32))
        }
    }
}

fn string<'a>(p: &'a Value, key: &str) -> Result<&'a str> {
    p.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Missing parameter: {}", key))
}

fn button(p: &Value) -> Result<MouseButton> {
    match p.get("button").and_then(Value::as_str) {
        Some(name) => MouseButton::parse(name),
        None => Ok(MouseButton::Left),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::automation::WindowInfo;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Automation for Recorder {
        fn mouse_move(&self, x: i32, y: i32) -> Result<()> {
            self.record(format!("move {} {}", x, y));
            Ok(())
        }
        fn mouse_click(&self, at: Option<(i32, i32)>, button: MouseButton, clicks: u32) -> Result<()> {
            self.record(format!("click {:?} {:?} {}", at, button, clicks));
            Ok(())
        }
        fn mouse_drag(&self, from: (i32, i32), to: (i32, i32), _: MouseButton) -> Result<()> {
            self.record(format!("drag {:?} {:?}", from, to));
            Ok(())
        }
        fn mouse_scroll(&self, amount: i32) -> Result<()> {
            self.record(format!("scroll {}", amount));
            Ok(())
        }
        fn mouse_position(&self) -> Result<(i32, i32)> {
            Ok((10, 20))
        }
        fn keyboard_type(&self, text: &str) -> Result<()> {
            self.record(format!("type {}", text));
            Ok(())
        }
        fn keyboard_press(&self, key: &str) -> Result<()> {
            self.record(format!("press {}", key));
            Ok(())
        }
        fn keyboard_hotkey(&self, keys: &[String]) -> Result<()> {
            self.record(format!("hotkey {}", keys.join("+")));
            Ok(())
        }
        fn screenshot(&self) -> Result<Vec<u8>> {
            Ok(vec![0x89, b'P', b'N', b'G'])
        }
        fn screen_size(&self) -> Result<(u32, u32)> {
            Ok((1920, 1080))
        }
        fn clipboard_get(&self) -> Result<String> {
            Ok("copied".into())
        }
        fn clipboard_set(&self, text: &str) -> Result<()> {
            self.record(format!("clip {}", text));
            Ok(())
        }
        fn window_list(&self) -> Result<Vec<WindowInfo>> {
            Ok(vec![
                WindowInfo { id: "1".into(), title: "Visual Studio Code".into(), pid: Some(7) },
                WindowInfo { id: "2".into(), title: "Notepad".into(), pid: None },
            ])
        }
        fn launch(&self, program: &str, args: &[String]) -> Result<u32> {
            self.record(format!("launch {} {}", program, args.join(" ")));
            Ok(4321)
        }
        fn open_url(&self, url: &str) -> Result<()> {
            self.record(format!("open {}", url));
            Ok(())
        }
    }

    fn setup() -> (Arc<Recorder>, HandlerRegistry) {
        let recorder = Arc::new(Recorder::default());
        let registry = HandlerRegistry::with_automation(recorder.clone());
        (recorder, registry)
    }

    fn call(registry: &HandlerRegistry, action: &str, params: Value) -> Result<Value> {
        let handler = registry.get(action).expect("action registered");
        handler(&params)
    }

    #[test]
    fn test_registers_all_actions() {
        let (_, registry) = setup();
        let actions = registry.actions();
        for name in [
            "ping", "mouse_move", "mouse_click", "mouse_drag", "mouse_scroll", "mouse_position",
            "keyboard_type", "keyboard_press", "keyboard_hotkey", "screenshot", "clipboard_get",
            "clipboard_set", "window_list", "window_find", "launch", "screen_size",
        ] {
            assert!(actions.contains(&name.to_string()), "missing {}", name);
        }
        assert!(registry.get("bogus").is_none());
    }

    #[test]
    fn test_keyboard_type_ascii_and_unicode() {
        let (recorder, registry) = setup();
        let r = call(&registry, "keyboard_type", json!({"text": "hello"})).unwrap();
        assert_eq!(r["method"], "keys");
        let r = call(&registry, "keyboard_type", json!({"text": "héllo 世界"})).unwrap();
        assert_eq!(r["method"], "clipboard");
        assert_eq!(
            recorder.calls(),
            vec!["type hello", "clip héllo 世界", "hotkey ctrl+v"]
        );
    }

    #[test]
    fn test_launch_routes_urls_to_open() {
        let (recorder, registry) = setup();
        let r = call(&registry, "launch", json!({"program": "https://example.com"})).unwrap();
        assert_eq!(r["opened"], "https://example.com");
        let r = call(
            &registry,
            "launch",
            json!({"program": "notepad.exe", "args": ["C:\\notes.txt"]}),
        )
        .unwrap();
        assert_eq!(r["pid"], 4321);
        assert_eq!(
            recorder.calls(),
            vec!["open https://example.com", "launch notepad.exe C:\\notes.txt"]
        );
    }

    #[test]
    fn test_launch_keeps_host_port_arguments() {
        let (recorder, registry) = setup();
        let r = call(
            &registry,
            "launch",
            json!({"program": "curl", "args": ["localhost:8080"]}),
        )
        .unwrap();
        assert_eq!(r["pid"], 4321);
        assert_eq!(recorder.calls(), vec!["launch curl localhost:8080"]);
    }

    #[test]
    fn test_window_find_case_insensitive() {
        let (_, registry) = setup();
        let r = call(&registry, "window_find", json!({"title": "studio"})).unwrap();
        let windows = r["windows"].as_array().unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0]["title"], "Visual Studio Code");
    }

    #[test]
    fn test_screenshot_is_base64() {
        let (_, registry) = setup();
        let r = call(&registry, "screenshot", Value::Null).unwrap();
        assert_eq!(r["image"], "iVBORw==");
    }

    #[test]
    fn test_missing_params_are_errors() {
        let (recorder, registry) = setup();
        let err = call(&registry, "mouse_move", json!({"x": 1})).unwrap_err();
        assert!(err.to_string().contains("y"));
        assert!(call(&registry, "mouse_click", json!({"button": "thumb"})).is_err());
        assert!(call(&registry, "keyboard_hotkey", json!({"keys": []})).is_err());
        assert!(call(&registry, "mouse_click", json!({"clicks": 4_294_967_298u64})).is_err());
        assert!(call(&registry, "mouse_click", json!({"clicks": 0})).is_err());
        assert!(call(&registry, "mouse_move", json!({"x": 1e12, "y": 0})).is_err());
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn test_click_without_position() {
        let (recorder, registry) = setup();
        call(&registry, "mouse_click", json!({"button": "right", "clicks": 2})).unwrap();
        assert_eq!(recorder.calls(), vec!["click None Right 2"]);
    }

    #[test]
    fn test_looks_like_url() {
        assert!(looks_like_url("https://example.com"));
        assert!(looks_like_url("www.example.com"));
        assert!(looks_like_url("mailto:someone@example.com"));
        assert!(!looks_like_url("C:\\Windows\\notepad.exe"));
        assert!(!looks_like_url("notepad"));
        assert!(!looks_like_url("/usr/bin/firefox"));
        assert!(looks_like_url("ftp://mirror.example.com/pub"));
        assert!(!looks_like_url("localhost:8080"));
        assert!(!looks_like_url("notes:todo"));
        assert!(!looks_like_url("origin:main"));
        assert!(!looks_like_url("file:///etc/passwd"));
    }
}
