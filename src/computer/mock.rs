use chrono::Utc;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

use super::font::{draw_text, fill_rect, stroke_rect, text_width};
use super::{ActionBudget, ActionError, ActionLogEntry, Artifact, ComputerAction};

pub const SCREEN_WIDTH: u32 = 1024;
pub const SCREEN_HEIGHT: u32 = 640;
const HOME_URL: &str = "mock://home";

const BACKGROUND: Rgb<u8> = Rgb([0xf5, 0xf5, 0xf5]);
const HEADER: Rgb<u8> = Rgb([0x25, 0x63, 0xeb]);
const WHITE: Rgb<u8> = Rgb([0xff, 0xff, 0xff]);
const BORDER: Rgb<u8> = Rgb([0xd1, 0xd5, 0xdb]);
const TEXT: Rgb<u8> = Rgb([0x37, 0x41, 0x51]);
const MUTED: Rgb<u8> = Rgb([0x6b, 0x72, 0x80]);
const ACCENT: Rgb<u8> = Rgb([0x05, 0x96, 0x69]);
const FOOTER: Rgb<u8> = Rgb([0xe5, 0xe7, 0xeb]);
const MARKER: Rgb<u8> = Rgb([0xef, 0x44, 0x44]);

/// Simulated browser used when no real automation is available.
pub struct MockComputer {
    budget: ActionBudget,
    current_url: String,
    history: Vec<ActionLogEntry>,
    last_notes: Vec<String>,
}

impl MockComputer {
    pub fn new(max_actions: u32) -> Self {
        Self {
            budget: ActionBudget::new(max_actions),
            current_url: HOME_URL.to_string(),
            history: Vec::new(),
            last_notes: Vec::new(),
        }
    }

    pub fn current_url(&self) -> &str {
        &self.current_url
    }

    pub fn history(&self) -> &[ActionLogEntry] {
        &self.history
    }

    pub fn action_count(&self) -> u32 {
        self.budget.used()
    }

    /// Run one action. Only the action budget can make this fail.
    pub fn execute(&mut self, action: &ComputerAction) -> Result<(Artifact, ActionLogEntry), ActionError> {
        let count = self.budget.consume()?;
        let description = action.describe();
        tracing::info!("[computer] MOCK action #{}: {}", count, description);

        self.last_notes = self.apply(action);

        let payload = serde_json::json!({
            "action": action,
            "count": count,
            "url": self.current_url,
            "notes": self.last_notes,
        });
        let entry = ActionLogEntry {
            action_type: action.kind().to_string(),
            timestamp: Utc::now(),
            payload,
        };
        self.history.push(entry.clone());

        let png = self.render(action, count, &description);
        Ok((
            Artifact {
                png,
                width: SCREEN_WIDTH,
                height: SCREEN_HEIGHT,
                caption: description,
            },
            entry,
        ))
    }

    pub fn state_json(&self) -> serde_json::Value {
        serde_json::json!({
            "url": self.current_url,
            "action_count": self.budget.used(),
            "max_actions": self.budget.limit(),
            "notes": self.last_notes,
            "success": true,
        })
    }

    fn apply(&mut self, action: &ComputerAction) -> Vec<String> {
        let mut notes = Vec::new();
        match action {
            ComputerAction::Navigate { url } => {
                self.current_url.clone_from(url);
                notes.push(format!("Navigated to {url}"));
            }
            ComputerAction::Click { selector, x, y } => {
                let target = selector.clone().unwrap_or_else(|| format!("({x}, {y})"));
                notes.push(format!("Clicked on {target}"));
                let lower = target.to_lowercase();
                if lower.contains("cart") {
                    self.current_url = "mock://cart".to_string();
                    notes.push("Navigated to cart page".to_string());
                } else if lower.contains("jacket") {
                    self.current_url = "mock://product/jacket".to_string();
                    notes.push("Viewing jacket product page".to_string());
                }
            }
            ComputerAction::Type { text, selector } => {
                let target = selector.as_deref().unwrap_or("focused element");
                notes.push(format!("Typed '{text}' into {target}"));
            }
            ComputerAction::Scroll { .. } => {
                notes.push(format!("{} performed", action.describe()));
            }
        }
        notes
    }

    fn render(&self, action: &ComputerAction, count: u32, description: &str) -> Vec<u8> {
        let mut img = RgbImage::from_pixel(SCREEN_WIDTH, SCREEN_HEIGHT, BACKGROUND);

        fill_rect(&mut img, 0, 0, SCREEN_WIDTH, 60, HEADER);
        let title = "MOCK BROWSER - COMPUTER USE SIMULATOR";
        let title_x = SCREEN_WIDTH.saturating_sub(text_width(title, 3)) / 2;
        draw_text(&mut img, title_x, 20, title, 3, WHITE);

        stroke_rect(&mut img, 20, 80, SCREEN_WIDTH - 40, 40, 2, BORDER);
        draw_text(&mut img, 30, 92, &format!("URL: {}", self.current_url), 2, TEXT);

        draw_text(
            &mut img,
            30,
            150,
            &format!("ACTION #{count}: {}", action.kind()),
            3,
            ACCENT,
        );
        draw_text(&mut img, 30, 190, description, 2, TEXT);

        let mut y = 240;
        draw_text(&mut img, 30, y, "RESULTS:", 2, MUTED);
        for note in &self.last_notes {
            y += 25;
            draw_text(&mut img, 50, y, &format!("+ {note}"), 2, ACCENT);
        }

        if let ComputerAction::Click { x, y, .. } = action {
            if let (Ok(cx), Ok(cy)) = (u32::try_from(*x), u32::try_from(*y)) {
                fill_rect(&mut img, cx.saturating_sub(8), cy, 17, 1, MARKER);
                fill_rect(&mut img, cx, cy.saturating_sub(8), 1, 17, MARKER);
            }
        }

        fill_rect(&mut img, 0, SCREEN_HEIGHT - 40, SCREEN_WIDTH, 40, FOOTER);
        draw_text(
            &mut img,
            20,
            SCREEN_HEIGHT - 28,
            &format!("MOCK MODE | ACTIONS: {count} | TIME: {}", Utc::now().format("%H:%M:%S")),
            2,
            MUTED,
        );

        let mut buf = Cursor::new(Vec::new());
        if let Err(e) = img.write_to(&mut buf, ImageFormat::Png) {
            tracing::warn!("[computer] failed to encode mock screenshot: {}", e);
        }
        buf.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actions() -> Vec<ComputerAction> {
        vec![
            ComputerAction::Navigate { url: "mock://shop".to_string() },
            ComputerAction::Click { x: 100, y: 200, selector: Some("#add-to-cart".to_string()) },
            ComputerAction::Type { text: "black jacket".to_string(), selector: None },
            ComputerAction::Scroll { direction: super::super::ScrollDirection::Up, amount: Some(3) },
        ]
    }

    #[test]
    fn test_every_action_succeeds_under_cap() {
        let mut mock = MockComputer::new(40);
        for action in actions().iter().cycle().take(40) {
            let (artifact, entry) = mock.execute(action).unwrap();
            assert_eq!((artifact.width, artifact.height), (SCREEN_WIDTH, SCREEN_HEIGHT));
            assert!(artifact.png.starts_with(&[0x89, b'P', b'N', b'G']));
            assert_eq!(entry.action_type, action.kind());
        }
        assert_eq!(mock.action_count(), 40);
        assert_eq!(mock.history().len(), 40);
    }

    #[test]
    fn test_action_after_cap_fails() {
        let mut mock = MockComputer::new(3);
        let nav = ComputerAction::Navigate { url: "mock://a".to_string() };
        for _ in 0..3 {
            mock.execute(&nav).unwrap();
        }
        assert_eq!(mock.execute(&nav).unwrap_err(), ActionError::BudgetExceeded { limit: 3 });
        assert_eq!(mock.history().len(), 3);
    }

    #[test]
    fn test_click_on_cart_changes_url() {
        let mut mock = MockComputer::new(5);
        mock.execute(&actions()[1]).unwrap();
        assert_eq!(mock.current_url(), "mock://cart");
        assert_eq!(mock.action_count(), 1);
    }

    #[test]
    fn test_log_entry_payload() {
        let mut mock = MockComputer::new(5);
        let (_, entry) = mock.execute(&actions()[0]).unwrap();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "navigate");
        assert_eq!(json["payload"]["url"], "mock://shop");
        assert_eq!(json["payload"]["count"], 1);
    }
}
