use reqwest::redirect;
use url::Url;

use crate::errors::AppError;

const LOOPBACK_MARKERS: [&str; 2] = ["localhost", "127.0.0.1"];
const MAX_REDIRECTS: usize = 10;

/// Rejects replay destinations that point back at the local machine unless
/// the service runs in development mode.
///
/// This is a substring match on the destination host after URL parsing.
/// IPv4 shorthand such as `127.1` or `0x7f000001` is normalized to
/// `127.0.0.1` by the parser and is caught. It does not resolve names or
/// catch `[::1]`, `0.0.0.0`, other `127.0.0.0/8` addresses or private
/// ranges; a resolved-address check belongs here when it is needed.
pub fn check_destination(destination: &Url, dev_mode: bool) -> Result<(), AppError> {
    if dev_mode {
        return Ok(());
    }

    let host = destination.host_str().unwrap_or_default().to_ascii_lowercase();
    if LOOPBACK_MARKERS.iter().any(|marker| host.contains(marker)) {
        return Err(AppError::UnsafeDestination(host));
    }
    Ok(())
}

/// Redirect policy for the replay client. Every hop is checked the same way
/// as the first destination, so a public host cannot bounce a replay back to
/// the local machine.
pub fn redirect_policy(dev_mode: bool) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        match check_destination(attempt.url(), dev_mode) {
            Ok(()) => attempt.follow(),
            Err(err) => attempt.error(err),
        }
    })
}
