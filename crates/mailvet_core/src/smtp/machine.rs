//! Banner-driven SMTP dialogue state machine
//!
//! The machine is pure: its input is one complete server reply, its output
//! is the next command to send or a terminal outcome. All socket handling
//! lives in the session; this file can be exercised entirely with canned
//! replies.

use crate::tags;

/// One complete server reply: a three-digit code and its text lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    /// Assemble a reply from raw protocol lines, honouring `250-` style
    /// continuations. All lines must carry the same code.
    pub fn from_lines(raw: &[String]) -> Result<Self, &'static str> {
        let mut code: Option<u16> = None;
        let mut lines = Vec::with_capacity(raw.len());
        for line in raw {
            if line.len() < 3 {
                return Err(tags::SMTP_UNEXPECTED_REPLY);
            }
            let parsed = line[..3]
                .parse::<u16>()
                .map_err(|_| tags::SMTP_UNEXPECTED_REPLY)?;
            match code {
                Some(existing) if existing != parsed => {
                    return Err(tags::SMTP_UNEXPECTED_REPLY);
                }
                _ => code = Some(parsed),
            }
            lines.push(line.get(4..).unwrap_or("").to_string());
        }
        match code {
            Some(code) => Ok(Self { code, lines }),
            None => Err(tags::SMTP_UNEXPECTED_REPLY),
        }
    }

    /// Whether a raw line terminates a reply (no `-` continuation marker).
    pub fn is_final_line(line: &str) -> bool {
        line.as_bytes().get(3).copied() != Some(b'-')
    }

    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitBanner,
    HeloSent,
    MailSent,
    RcptSent,
    Done,
}

/// What the driver should do after feeding a reply to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write this command and read the next reply.
    Send(String),
    /// The exchange accepted the recipient.
    Accept,
    /// The exchange permanently rejected the recipient (550/553).
    Reject,
    /// The dialogue cannot decide; carries the error tag.
    Fail(&'static str),
}

/// Dialogue machine for one `RCPT` probe:
/// `WaitBanner -(220)-> HeloSent -(250)-> MailSent -(250)-> RcptSent -> terminal`.
pub struct ProbeMachine {
    state: State,
    helo_host: String,
    mail_from: String,
    rcpt_to: String,
}

impl ProbeMachine {
    pub fn new(helo_host: &str, mail_from: &str, rcpt_to: &str) -> Self {
        Self {
            state: State::WaitBanner,
            helo_host: helo_host.to_string(),
            mail_from: mail_from.to_string(),
            rcpt_to: rcpt_to.to_string(),
        }
    }

    /// Advance on one complete reply.
    ///
    /// Permanent rejections only decide the probe after `RCPT`; anywhere
    /// earlier they make the dialogue inconclusive.
    pub fn on_reply(&mut self, reply: &SmtpReply) -> Step {
        let step = match self.state {
            State::WaitBanner if reply.code == 220 => {
                self.state = State::HeloSent;
                Step::Send(format!("HELO {}", self.helo_host))
            }
            State::HeloSent if reply.is_positive() => {
                self.state = State::MailSent;
                Step::Send(format!("MAIL FROM:<{}>", self.mail_from))
            }
            State::MailSent if reply.is_positive() => {
                self.state = State::RcptSent;
                Step::Send(format!("RCPT TO:<{}>", self.rcpt_to))
            }
            State::RcptSent if reply.is_positive() => Step::Accept,
            State::RcptSent if matches!(reply.code, 550 | 553) => Step::Reject,
            State::RcptSent if reply.is_transient() => Step::Fail(tags::SMTP_DEFERRED),
            State::Done => Step::Fail(tags::SMTP_UNEXPECTED_REPLY),
            _ => Step::Fail(tags::SMTP_UNEXPECTED_REPLY),
        };
        if !matches!(step, Step::Send(_)) {
            self.state = State::Done;
        }
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reply(code: u16, text: &str) -> SmtpReply {
        SmtpReply {
            code,
            lines: vec![text.to_string()],
        }
    }

    fn machine() -> ProbeMachine {
        ProbeMachine::new("probe.local", "postmaster@probe.local", "user@example.com")
    }

    #[test]
    fn test_accept_path() {
        let mut m = machine();
        assert_eq!(
            m.on_reply(&reply(220, "mx.example.com ESMTP")),
            Step::Send("HELO probe.local".to_string())
        );
        assert_eq!(
            m.on_reply(&reply(250, "mx.example.com")),
            Step::Send("MAIL FROM:<postmaster@probe.local>".to_string())
        );
        assert_eq!(
            m.on_reply(&reply(250, "2.1.0 Ok")),
            Step::Send("RCPT TO:<user@example.com>".to_string())
        );
        assert_eq!(m.on_reply(&reply(250, "2.1.5 Ok")), Step::Accept);
    }

    #[test]
    fn test_reject_after_rcpt() {
        for code in [550, 553] {
            let mut m = machine();
            m.on_reply(&reply(220, "banner"));
            m.on_reply(&reply(250, "helo ok"));
            m.on_reply(&reply(250, "mail ok"));
            assert_eq!(m.on_reply(&reply(code, "5.1.1 no such user")), Step::Reject);
        }
    }

    #[test]
    fn test_550_before_rcpt_is_inconclusive() {
        let mut m = machine();
        m.on_reply(&reply(220, "banner"));
        assert_eq!(
            m.on_reply(&reply(550, "not you")),
            Step::Fail(tags::SMTP_UNEXPECTED_REPLY)
        );
    }

    #[test]
    fn test_greylisting_is_inconclusive() {
        let mut m = machine();
        m.on_reply(&reply(220, "banner"));
        m.on_reply(&reply(250, "helo ok"));
        m.on_reply(&reply(250, "mail ok"));
        assert_eq!(
            m.on_reply(&reply(451, "4.7.1 greylisted, try later")),
            Step::Fail(tags::SMTP_DEFERRED)
        );
    }

    #[test]
    fn test_unexpected_banner() {
        let mut m = machine();
        assert_eq!(
            m.on_reply(&reply(554, "no service")),
            Step::Fail(tags::SMTP_UNEXPECTED_REPLY)
        );
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let mut m = machine();
        m.on_reply(&reply(554, "no service"));
        assert_eq!(
            m.on_reply(&reply(250, "too late")),
            Step::Fail(tags::SMTP_UNEXPECTED_REPLY)
        );
    }

    #[test]
    fn test_reply_from_lines() {
        let raw = vec![
            "250-mx.example.com".to_string(),
            "250-SIZE 35882577".to_string(),
            "250 STARTTLS".to_string(),
        ];
        let reply = SmtpReply::from_lines(&raw).unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.lines[2], "STARTTLS");
    }

    #[test]
    fn test_reply_from_lines_rejects_mixed_codes() {
        let raw = vec!["250-ok".to_string(), "550 no".to_string()];
        assert!(SmtpReply::from_lines(&raw).is_err());
    }

    #[test]
    fn test_final_line_detection() {
        assert!(SmtpReply::is_final_line("250 done"));
        assert!(!SmtpReply::is_final_line("250-more"));
        // A bare code with no text terminates the reply.
        assert!(SmtpReply::is_final_line("250"));
    }
}
