/*! Integration tests for Portal.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - auth: Tests for the login, registration and logout flows
 * - backend: Tests for the REST backend against a mock HTTP server
 * - gateway: Tests for validated mutations and their consistency policies
 * - mirror: Tests for mirror ordering and idempotence
 * - reconcile: Tests for applying change events to mirrors
 * - session: Tests for session transitions as seen by the sync engine
 * - sync: Tests for the sync engine lifecycle, retries and change feeds
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("portal=info".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

mod backend;
mod helpers;
mod sync;
