use super::{HandlerError, PreWriteHandler};
use crate::event::{Event, EventBody};
use crate::hooks::{HookPayload, PreCommitHook};
use crate::http::WebhookStatus;
use crate::models::assets::OrgAssets;
use crate::models::http_log::{HttpLog, WebhookResult, CONNECTION_ERROR_BODY, LOG_TYPE_WEBHOOK_CALLED};
use crate::models::resthook::ResthookUnsubscribe;
use crate::scene::Scene;

/// Handles `webhook_called`.
///
/// Every call is logged and recorded as a webhook result. A resthook call that
/// came back 410 also removes the subscriber.
pub struct WebhookCalled;

impl PreWriteHandler for WebhookCalled {
    fn name(&self) -> &'static str {
        "webhook_called"
    }

    fn handle(&self, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<(), HandlerError> {
        let EventBody::WebhookCalled {
            url,
            status,
            status_code,
            elapsed_ms,
            retries,
            resthook,
            request,
            response,
        } = &event.body
        else {
            return Ok(());
        };

        // the step may belong to a flow deleted since, in which case the log has no flow
        let flow_id = scene
            .session()
            .zip(event.step_uuid)
            .and_then(|(session, step)| session.find_step(&step))
            .and_then(|(run, _)| oa.flow_by_uuid(&run.flow.uuid))
            .map(|flow| flow.id);

        if *status == WebhookStatus::SubscriberGone {
            if let Some(slug) = resthook {
                let unsub = ResthookUnsubscribe {
                    org_id: oa.org_id(),
                    slug: slug.clone(),
                    url: url.clone(),
                };
                scene.append_to_pre_commit(
                    PreCommitHook::UnsubscribeResthooks,
                    HookPayload::ResthookUnsubscribe(unsub),
                );
            }
        }

        let log = HttpLog {
            org_id: oa.org_id(),
            flow_id,
            log_type: LOG_TYPE_WEBHOOK_CALLED,
            url: url.clone(),
            status_code: *status_code,
            request: request.clone(),
            response: response.clone(),
            is_error: *status != WebhookStatus::Success,
            elapsed_ms: *elapsed_ms,
            retries: *retries,
            created_on: event.created_on,
        };
        scene.append_to_pre_commit(PreCommitHook::InsertHttpLogs, HookPayload::HttpLog(log));

        let response = if *status == WebhookStatus::ConnectionError {
            CONNECTION_ERROR_BODY.to_string()
        } else {
            response.clone()
        };
        let result = WebhookResult {
            org_id: oa.org_id(),
            contact_id: scene.contact_id(),
            url: url.clone(),
            request: request.clone(),
            status_code: *status_code,
            response,
            elapsed_ms: *elapsed_ms,
            created_on: event.created_on,
        };
        scene.append_to_pre_commit(PreCommitHook::InsertWebhookResults, HookPayload::WebhookResult(result));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testdata::scene;
    use crate::models::assets::testdata::org_assets;
    use crate::models::FlowId;

    fn webhook_called(status: WebhookStatus, status_code: i32, resthook: Option<&str>) -> Event {
        Event::new(EventBody::WebhookCalled {
            url: "https://example.com/hook".to_string(),
            status,
            status_code,
            elapsed_ms: 123,
            retries: 0,
            resthook: resthook.map(str::to_string),
            request: "POST /hook HTTP/1.1\r\n\r\n{}".to_string(),
            response: "HTTP/1.1 410 Gone\r\n\r\n".to_string(),
        })
    }

    #[test]
    fn test_gone_resthook_unsubscribes() {
        let oa = org_assets();
        let mut scene = scene(&oa);
        let step = scene.session().unwrap().runs[0].path[0].uuid;
        let event = webhook_called(WebhookStatus::SubscriberGone, 410, Some("new-registration")).with_step(step);

        WebhookCalled.handle(&oa, &mut scene, &event).unwrap();

        match scene.pre_commit_payloads(PreCommitHook::UnsubscribeResthooks) {
            [HookPayload::ResthookUnsubscribe(unsub)] => {
                assert_eq!(unsub.slug, "new-registration");
                assert_eq!(unsub.url, "https://example.com/hook");
            }
            other => panic!("unexpected payloads: {other:?}"),
        }
        match scene.pre_commit_payloads(PreCommitHook::InsertHttpLogs) {
            [HookPayload::HttpLog(log)] => {
                assert!(log.is_error);
                assert_eq!(log.status_code, 410);
                assert_eq!(log.flow_id, Some(FlowId(1)));
                assert_eq!(log.log_type, LOG_TYPE_WEBHOOK_CALLED);
            }
            other => panic!("unexpected payloads: {other:?}"),
        }
        assert_eq!(scene.pre_commit_payloads(PreCommitHook::InsertWebhookResults).len(), 1);
    }

    #[test]
    fn test_gone_plain_webhook_keeps_subscribers() {
        let oa = org_assets();
        let mut scene = scene(&oa);

        WebhookCalled
            .handle(&oa, &mut scene, &webhook_called(WebhookStatus::SubscriberGone, 410, None))
            .unwrap();
        assert!(scene.pre_commit_payloads(PreCommitHook::UnsubscribeResthooks).is_empty());
        assert_eq!(scene.pre_commit_payloads(PreCommitHook::InsertHttpLogs).len(), 1);
    }

    #[test]
    fn test_connection_error_result() {
        let oa = org_assets();
        let mut scene = scene(&oa);

        WebhookCalled
            .handle(&oa, &mut scene, &webhook_called(WebhookStatus::ConnectionError, 0, None))
            .unwrap();

        match scene.pre_commit_payloads(PreCommitHook::InsertWebhookResults) {
            [HookPayload::WebhookResult(result)] => {
                assert_eq!(result.response, CONNECTION_ERROR_BODY);
                assert_eq!(result.status_code, 0);
            }
            other => panic!("unexpected payloads: {other:?}"),
        }
        match scene.pre_commit_payloads(PreCommitHook::InsertHttpLogs) {
            [HookPayload::HttpLog(log)] => assert_eq!(log.flow_id, None),
            other => panic!("unexpected payloads: {other:?}"),
        }
    }

    #[test]
    fn test_success_is_not_an_error() {
        let oa = org_assets();
        let mut scene = scene(&oa);

        WebhookCalled
            .handle(&oa, &mut scene, &webhook_called(WebhookStatus::Success, 200, Some("new-registration")))
            .unwrap();
        match scene.pre_commit_payloads(PreCommitHook::InsertHttpLogs) {
            [HookPayload::HttpLog(log)] => assert!(!log.is_error),
            other => panic!("unexpected payloads: {other:?}"),
        }
        assert!(scene.pre_commit_payloads(PreCommitHook::UnsubscribeResthooks).is_empty());
    }
}
