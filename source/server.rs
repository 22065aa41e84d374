// Downward IMAP session state machine: the half of SfPair that speaks to the local client.
// Tracks PREAUTH -> AUTH -> SELECTED and the handful of pause states that need SF-Pair to finish
// something upstream (a pending LOGIN, SELECT, passthrough command, or logout) before this side
// can answer.

use imap_types::{command::Command, response::Response};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
  Preauth,
  Authenticated,
  Selected,
  Logout,
}

/// What the server is blocked on before it can send its next response. SfPair drives these to
/// completion and calls the matching `resume_*`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pause {
  None,
  AwaitingGreeting,
  AwaitingLogin,
  AwaitingSelect(String),
  AwaitingPassthru,
  AwaitingClose,
  AwaitingLogout,
}

pub struct Server {
  state: State,
  pause: Pause,
  mailbox_name: Option<String>,
}

impl Server {
  pub fn new() -> Self {
    Self {
      state: State::Preauth,
      pause: Pause::AwaitingGreeting,
      mailbox_name: None,
    }
  }

  pub fn state(&self) -> State {
    self.state
  }

  pub fn pause(&self) -> &Pause {
    &self.pause
  }

  pub fn ready(&self) -> bool {
    self.pause == Pause::None
  }

  pub fn greeting(&self) -> Response<'static> {
    Response::Status(
      imap_types::response::Status::Greeting(imap_types::response::Greeting::ok(None, "citm ready").unwrap()),
    )
  }

  pub fn greeted(&mut self) {
    self.pause = Pause::None;
  }

  /// Inspects an incoming command just enough to decide whether it needs SF-Pair's help, without
  /// fully dispatching it; dn.rs owns FETCH/STORE/SEARCH/COPY semantics once SELECTED.
  pub fn on_command(&mut self, command: &Command<'_>) {
    use imap_types::command::CommandBody;
    match &command.body {
      CommandBody::Login { .. } => self.pause = Pause::AwaitingLogin,
      CommandBody::Select { mailbox } | CommandBody::Examine { mailbox } => {
        self.pause = Pause::AwaitingSelect(mailbox.to_string())
      }
      CommandBody::List { .. }
      | CommandBody::Lsub { .. }
      | CommandBody::Status { .. }
      | CommandBody::Create { .. }
      | CommandBody::Delete { .. }
      | CommandBody::Rename { .. }
      | CommandBody::Subscribe { .. }
      | CommandBody::Unsubscribe { .. } => self.pause = Pause::AwaitingPassthru,
      CommandBody::Close => self.pause = Pause::AwaitingClose,
      CommandBody::Logout => self.pause = Pause::AwaitingLogout,
      _ => {}
    }
  }

  pub fn login_accepted(&mut self) {
    self.state = State::Authenticated;
    self.pause = Pause::None;
  }

  pub fn login_rejected(&mut self) {
    self.pause = Pause::None;
  }

  pub fn selected(&mut self, mailbox_name: String) {
    self.state = State::Selected;
    self.mailbox_name = Some(mailbox_name);
    self.pause = Pause::None;
  }

  pub fn select_failed(&mut self) {
    self.pause = Pause::None;
  }

  pub fn passthru_done(&mut self) {
    self.pause = Pause::None;
  }

  pub fn closed(&mut self) {
    self.state = State::Authenticated;
    self.mailbox_name = None;
    self.pause = Pause::None;
  }

  pub fn logged_out(&mut self) {
    self.state = State::Logout;
    self.pause = Pause::None;
  }

  pub fn mailbox_name(&self) -> Option<&str> {
    self.mailbox_name.as_deref()
  }
}

impl Default for Server {
  fn default() -> Self {
    Self::new()
  }
}
