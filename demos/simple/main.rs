use posthog::{
    Client, ClientConfig, Event, FlagOptions, Group, RequestScope, RequestScopedFeatureFlagCache,
    ThreadLocalScopeAccessor,
};
use std::sync::Arc;

pub fn main() -> posthog::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("posthog=debug"))
        .init();

    // Reads POSTHOG_PROJECT_API_KEY, POSTHOG_PERSONAL_API_KEY and POSTHOG_HOST.
    let client = ClientConfig::from_env()?
        .feature_flag_cache(RequestScopedFeatureFlagCache::new(ThreadLocalScopeAccessor))
        .to_client()?;

    // Local evaluation needs a personal API key. Without one, every flag is evaluated by the
    // server.
    let poller = match client.start_poller_thread() {
        Ok(poller) => match poller.wait_for_configuration() {
            Ok(()) => Some(poller),
            Err(err) => {
                eprintln!("Local evaluation is not available: {err}");
                None
            }
        },
        Err(err) => {
            eprintln!("Cannot start poller thread: {err}");
            None
        }
    };

    client.capture(
        Event::new("demo started", "test-user")
            .property("source", "simple demo")
            .group(Group::new("company", "acme")),
    )?;

    // Everything evaluated while the scope is entered asks the server at most once per user.
    let scope = Arc::new(RequestScope::new());
    {
        let _guard = RequestScope::enter(&scope);
        let options = FlagOptions::new().person_property("plan", "enterprise");

        let enabled = client.is_feature_enabled("beta-feature", "test-user", &options)?;
        println!("beta-feature enabled: {enabled}");

        for (key, flag) in client.get_all_feature_flags("test-user", &options)? {
            println!("{key}: {} (payload: {:?})", flag.value, flag.payload);
        }
    }

    client.shutdown()?;
    if let Some(poller) = poller {
        poller.shutdown()?;
    }
    Ok(())
}
