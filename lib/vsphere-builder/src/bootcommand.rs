// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot commands: the keystrokes typed into a VM console to drive an
//! installer.
//!
//! A command is plain text mixed with special keys in angle brackets, such as
//! `<enter>`, `<tab>`, `<f2>` or `<leftCtrlOn>`, and pauses such as `<wait>`
//! (one second), `<wait5>` (five seconds) or `<wait1m30s>`. Before parsing,
//! `{{ .HTTPIP }}`, `{{ .HTTPPort }}` and `{{ .Name }}` are replaced with the
//! boot-file server address and the VM name.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BootCommandError {
    #[error("unknown special key <{0}>")]
    UnknownKey(String),

    #[error("invalid wait <{0}>")]
    BadWait(String),

    #[error("unknown template variable {0:?}")]
    UnknownVariable(String),

    #[error("template variable {0} is not available in this build")]
    Unavailable(&'static str),

    #[error("unterminated template expression")]
    Unterminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Tab,
    Esc,
    Backspace,
    Delete,
    Space,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    Insert,
    F(u8),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyStroke {
    pub key: Key,
    pub modifiers: Modifiers,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootAction {
    Type(Vec<KeyStroke>),
    Wait(Duration),
}

/// Values substituted into boot commands.
#[derive(Clone, Debug, Default)]
pub struct TemplateVars {
    pub http_ip: Option<String>,
    pub http_port: Option<u16>,
    pub name: String,
}

pub fn render(
    template: &str,
    vars: &TemplateVars,
) -> Result<String, BootCommandError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(BootCommandError::Unterminated)?;
        let var = after[..end].trim();
        match var {
            ".HTTPIP" => out.push_str(
                vars.http_ip
                    .as_deref()
                    .ok_or(BootCommandError::Unavailable("HTTPIP"))?,
            ),
            ".HTTPPort" => out.push_str(
                &vars
                    .http_port
                    .ok_or(BootCommandError::Unavailable("HTTPPort"))?
                    .to_string(),
            ),
            ".Name" => out.push_str(&vars.name),
            other => {
                return Err(BootCommandError::UnknownVariable(other.to_owned()))
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[derive(Clone, Copy)]
enum Modifier {
    Ctrl,
    Alt,
    Shift,
}

impl Modifiers {
    fn set(&mut self, which: Modifier, on: bool) {
        match which {
            Modifier::Ctrl => self.ctrl = on,
            Modifier::Alt => self.alt = on,
            Modifier::Shift => self.shift = on,
        }
    }
}

enum Special {
    Key(Key),
    Wait(Duration),
    Modifier(Modifier, bool),
}

fn special(name: &str) -> Result<Special, BootCommandError> {
    let lower = name.to_ascii_lowercase();
    let key = match lower.as_str() {
        "enter" | "return" => Key::Enter,
        "tab" => Key::Tab,
        "esc" => Key::Esc,
        "bs" => Key::Backspace,
        "del" => Key::Delete,
        "spacebar" => Key::Space,
        "up" => Key::Up,
        "down" => Key::Down,
        "left" => Key::Left,
        "right" => Key::Right,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" => Key::PageUp,
        "pagedown" => Key::PageDown,
        "insert" => Key::Insert,
        s if s.starts_with("wait") => {
            let arg = &s[4..];
            let wait = if arg.is_empty() {
                Duration::from_secs(1)
            } else if arg.bytes().all(|b| b.is_ascii_digit()) {
                let secs =
                    arg.parse().map_err(|_| BootCommandError::BadWait(name.into()))?;
                Duration::from_secs(secs)
            } else {
                vsphere_builder_config::duration::parse(arg)
                    .map_err(|_| BootCommandError::BadWait(name.into()))?
            };
            return Ok(Special::Wait(wait));
        }
        s if s.starts_with('f') && s.len() > 1 => match s[1..].parse::<u8>() {
            Ok(n @ 1..=12) => Key::F(n),
            _ => return Err(BootCommandError::UnknownKey(name.into())),
        },
        s => {
            let (side_less, on) = if let Some(m) = s.strip_suffix("on") {
                (m, true)
            } else if let Some(m) = s.strip_suffix("off") {
                (m, false)
            } else {
                return Err(BootCommandError::UnknownKey(name.into()));
            };
            let m = side_less
                .strip_prefix("left")
                .or_else(|| side_less.strip_prefix("right"))
                .ok_or_else(|| BootCommandError::UnknownKey(name.into()))?;
            let which = match m {
                "ctrl" => Modifier::Ctrl,
                "alt" => Modifier::Alt,
                "shift" => Modifier::Shift,
                _ => return Err(BootCommandError::UnknownKey(name.into())),
            };
            return Ok(Special::Modifier(which, on));
        }
    };
    Ok(Special::Key(key))
}

/// Parses a rendered boot command into actions.
pub fn parse(command: &str) -> Result<Vec<BootAction>, BootCommandError> {
    let mut actions = Vec::new();
    let mut keys = Vec::new();
    let mut mods = Modifiers::default();
    let mut rest = command;

    while let Some(c) = rest.chars().next() {
        if c == '<' {
            if let Some(end) = rest[1..].find('>') {
                let name = &rest[1..1 + end];
                if !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_alphanumeric())
                {
                    match special(name)? {
                        Special::Key(key) => {
                            keys.push(KeyStroke { key, modifiers: mods })
                        }
                        Special::Wait(d) => {
                            if !keys.is_empty() {
                                actions.push(BootAction::Type(std::mem::take(
                                    &mut keys,
                                )));
                            }
                            actions.push(BootAction::Wait(d));
                        }
                        Special::Modifier(which, on) => mods.set(which, on),
                    }
                    rest = &rest[end + 2..];
                    continue;
                }
            }
        }
        let key = if c == ' ' { Key::Space } else { Key::Char(c) };
        keys.push(KeyStroke { key, modifiers: mods });
        rest = &rest[c.len_utf8()..];
    }

    if !keys.is_empty() {
        actions.push(BootAction::Type(keys));
    }
    Ok(actions)
}

#[cfg(test)]
mod test {
    use super::*;

    fn plain(key: Key) -> KeyStroke {
        KeyStroke { key, modifiers: Modifiers::default() }
    }

    #[test]
    fn render_substitutes_known_variables() {
        let vars = TemplateVars {
            http_ip: Some("10.0.0.5".into()),
            http_port: Some(8123),
            name: "ubuntu".into(),
        };
        assert_eq!(
            render("ks=http://{{ .HTTPIP }}:{{.HTTPPort}}/{{ .Name }}.cfg", &vars)
                .unwrap(),
            "ks=http://10.0.0.5:8123/ubuntu.cfg"
        );
        assert_eq!(
            render("{{ .Nope }}", &vars),
            Err(BootCommandError::UnknownVariable(".Nope".into()))
        );
        assert_eq!(render("{{ .Name", &vars), Err(BootCommandError::Unterminated));
    }

    #[test]
    fn render_without_http_server() {
        let vars = TemplateVars { name: "vm".into(), ..Default::default() };
        assert_eq!(
            render("{{ .HTTPIP }}", &vars),
            Err(BootCommandError::Unavailable("HTTPIP"))
        );
    }

    #[test]
    fn parse_text_specials_and_waits() {
        let actions = parse("a b<enter><wait5>x<wait1m>").unwrap();
        assert_eq!(
            actions,
            vec![
                BootAction::Type(vec![
                    plain(Key::Char('a')),
                    plain(Key::Space),
                    plain(Key::Char('b')),
                    plain(Key::Enter),
                ]),
                BootAction::Wait(Duration::from_secs(5)),
                BootAction::Type(vec![plain(Key::Char('x'))]),
                BootAction::Wait(Duration::from_secs(60)),
            ]
        );
        assert_eq!(
            parse("<wait>").unwrap(),
            vec![BootAction::Wait(Duration::from_secs(1))]
        );
    }

    #[test]
    fn modifiers_apply_until_released() {
        let actions = parse("<leftCtrlOn>c<leftCtrlOff>d").unwrap();
        let BootAction::Type(keys) = &actions[0] else {
            panic!("expected keys");
        };
        assert!(keys[0].modifiers.ctrl);
        assert!(!keys[1].modifiers.ctrl);
    }

    #[test]
    fn unknown_and_literal_brackets() {
        assert_eq!(
            parse("<bogus>"),
            Err(BootCommandError::UnknownKey("bogus".into()))
        );
        assert_eq!(parse("<f13>"), Err(BootCommandError::UnknownKey("f13".into())));
        assert_eq!(
            parse("<f2>").unwrap(),
            vec![BootAction::Type(vec![plain(Key::F(2))])]
        );
        // Not a key name, so typed as-is.
        let actions = parse("a < b").unwrap();
        let BootAction::Type(keys) = &actions[0] else {
            panic!("expected keys");
        };
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[2], plain(Key::Char('<')));
    }
}
