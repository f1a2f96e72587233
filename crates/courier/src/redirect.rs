use http::header::{AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, StatusCode};
/// A type that controls the policy on how to handle the following of redirects.
///
/// The default value will catch redirect loops, and has a maximum of 10
/// redirects it will follow in a chain before stopping.
///
/// - `limited` can be used have the same as the default behavior, but adjust
///   the allowed maximum redirect hops in a chain.
/// - `none` can be used to disable all redirect behavior, returning the
///   first 3xx response verbatim.
#[derive(Clone, Debug, PartialEq)]
pub enum Policy {
  /// - `limited` can be used have the same as the default behavior, but adjust
  Limit(usize),
  /// - `none` can be used to disable all redirect behavior.
  None,
}
/// A type that holds information on the next request and previous requests
/// in redirect chain.
#[derive(Clone, Debug, PartialEq)]
pub struct Attempt<'a> {
  status: StatusCode,
  next: &'a http::Uri,
  previous: &'a [http::Uri],
}
/// An action to perform when a redirect status code is found.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
  /// Follow
  Follow,
  /// Stop
  Stop,
}

impl Policy {
  /// Create a `Policy` with a maximum number of redirects.
  pub fn limited(max: usize) -> Self {
    Policy::Limit(max)
  }
  /// Create a `Policy` that does not follow any redirect.
  pub fn none() -> Self {
    Policy::None
  }
  /// Decide what to do with a redirect attempt under this policy.
  pub fn redirect(&self, attempt: Attempt) -> Action {
    match self {
      Policy::Limit(max) => {
        if attempt.previous.len() >= *max {
          attempt.stop()
        } else {
          attempt.follow()
        }
      }
      Policy::None => attempt.stop(),
    }
  }

  pub(crate) fn check(
    &self,
    status: StatusCode,
    next: &http::Uri,
    previous: &[http::Uri],
  ) -> Action {
    self.redirect(Attempt {
      status,
      next,
      previous,
    })
  }
}

impl Default for Policy {
  fn default() -> Policy {
    Policy::limited(10)
  }
}

impl<'a> Attempt<'a> {
  /// Get the type of redirect.
  pub fn status(&self) -> StatusCode {
    self.status
  }
  /// Get the next URL to redirect to.
  pub fn url(&self) -> &http::Uri {
    self.next
  }
  /// Get the list of previous URLs that have already been requested in this chain.
  pub fn previous(&self) -> &[http::Uri] {
    self.previous
  }
  /// Returns an action meaning courier should follow the next URL.
  pub fn follow(self) -> Action {
    Action::Follow
  }
  /// Returns an action meaning courier should not follow the next URL.
  ///
  /// The 30x response will be returned as the `Ok` result.
  pub fn stop(self) -> Action {
    Action::Stop
  }
}

pub(crate) fn remove_sensitive_headers(
  headers: &mut HeaderMap,
  next: &http::Uri,
  previous: &[http::Uri],
) {
  if let Some(previous) = previous.last() {
    let cross_host = next.host() != previous.host() || next.port_u16() != previous.port_u16();
    if cross_host {
      headers.remove(AUTHORIZATION);
      headers.remove(COOKIE);
      headers.remove("cookie2");
      headers.remove(PROXY_AUTHORIZATION);
      headers.remove(WWW_AUTHENTICATE);
    }
  }
}
