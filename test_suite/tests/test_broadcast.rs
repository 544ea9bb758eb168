mod common;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use mrpc::*;
    use user_model::*;

    use crate::common::*;

    async fn three_instances_one_broken() -> (Vec<RunningServer>, Arc<XClient>) {
        let mut servers = Vec::new();
        let mut instances = Vec::new();
        for (name, broken) in [("a", false), ("b", true), ("c", false)] {
            let server = start_instance(name, broken, None).await;
            instances.push(ServiceInstance::new(
                UserServiceClient::SERVICE_NAME,
                &server.local_addr().to_string(),
            ));
            servers.push(server);
        }
        let registry = Arc::new(StaticRegistry::new(instances));
        let xclient = XClient::new(UserServiceClient::SERVICE_NAME, registry, Opt::default())
            .await
            .unwrap();
        (servers, Arc::new(xclient))
    }

    #[tokio::test]
    async fn broadcast_all_delivers_one_result_per_instance() {
        let (servers, xclient) = three_instances_one_broken().await;
        let users = UserServiceClient::new(xclient.clone());

        let replies = users
            .stub()
            .broadcast_all::<_, UserReply>(Context::new(), "GetById", &GetByIdReq { id: 1 })
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(3, replies.len());

        let failed: Vec<&Error> = replies.iter().filter_map(|(_, r)| r.as_ref().err()).collect();
        assert_eq!(1, failed.len());
        assert_eq!(ErrorKind::Server, failed[0].kind());
        assert_eq!("b: user table unavailable", failed[0].message());

        let mut served: Vec<String> = replies
            .into_iter()
            .filter_map(|(_, r)| r.ok())
            .map(|reply| reply.served_by)
            .collect();
        served.sort();
        assert_eq!(vec!["a".to_owned(), "c".to_owned()], served);

        xclient.close();
        for server in servers {
            server.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn broadcast_all_reports_the_address_of_each_reply() {
        let (servers, xclient) = three_instances_one_broken().await;
        let mut expected: Vec<String> = servers.iter().map(|s| s.local_addr().to_string()).collect();
        expected.sort();

        let mut rx = xclient
            .broadcast(
                &Context::new(),
                Request::new(UserServiceClient::SERVICE_NAME, "GetById")
                    .with_message_id(next_message_id())
                    .with_codes(SerializeType::JSON, CompressType::CompressNone)
                    .with_data(b"{\"id\":2}".to_vec()),
            )
            .unwrap();
        let mut addresses = Vec::new();
        while let Some(reply) = rx.recv().await {
            // application errors travel inside the response
            assert!(reply.result.is_ok());
            addresses.push(reply.address);
        }
        addresses.sort();
        assert_eq!(expected, addresses);

        xclient.close();
        for server in servers {
            server.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn broadcast_fastest_skips_failing_instances() {
        let (servers, xclient) = three_instances_one_broken().await;
        let users = UserServiceClient::new(xclient.clone()).with_mode(CallMode::BroadcastFastest);

        for _ in 0..5 {
            let reply = users
                .get_by_id(Context::new(), GetByIdReq { id: 2 })
                .await
                .unwrap();
            assert_ne!("b", reply.served_by);
            assert_eq!("bob", reply.user.name);
        }

        // when every instance fails the last failure is returned
        let err = users
            .get_by_id(Context::new(), GetByIdReq { id: 99 })
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Server, err.kind());

        xclient.close();
        for server in servers {
            server.close().await.unwrap();
        }
    }

    async fn two_sleepers() -> (Vec<RunningServer>, Arc<XClient>) {
        let mut servers = Vec::new();
        let mut instances = Vec::new();
        for name in ["slow-a", "slow-b"] {
            let server = start_instance(name, false, None).await;
            instances.push(ServiceInstance::new(
                UserServiceClient::SERVICE_NAME,
                &server.local_addr().to_string(),
            ));
            servers.push(server);
        }
        let registry = Arc::new(StaticRegistry::new(instances));
        let xclient = XClient::new(UserServiceClient::SERVICE_NAME, registry, Opt::default())
            .await
            .unwrap();
        (servers, Arc::new(xclient))
    }

    const SLOW: SleepReq = SleepReq { millis: 2000 };

    /// The caller's timer or the server's copy of the deadline may fire first.
    fn assert_deadline(err: &Error) {
        assert!(
            matches!(err.kind(), ErrorKind::Timeout | ErrorKind::Server),
            "{}",
            err
        );
        assert!(err.message().contains("deadline exceeded"), "{}", err);
    }

    #[tokio::test]
    async fn broadcast_fastest_gives_up_at_the_deadline() {
        let (servers, xclient) = two_sleepers().await;
        let users = UserServiceClient::new(xclient.clone()).with_mode(CallMode::BroadcastFastest);

        let start = Instant::now();
        let ctx = Context::new().with_timeout(Duration::from_millis(300));
        let err = users.sleep(ctx, SLOW).await.unwrap_err();
        assert_deadline(&err);
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());

        xclient.close();
        for server in servers {
            server.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn broadcast_all_branches_share_the_deadline() {
        let (servers, xclient) = two_sleepers().await;
        let users = UserServiceClient::new(xclient.clone());

        let start = Instant::now();
        let ctx = Context::new().with_timeout(Duration::from_millis(300));
        let replies = users
            .stub()
            .broadcast_all::<_, SleepReq>(ctx, "Sleep", &SLOW)
            .await
            .unwrap()
            .collect()
            .await;
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
        assert_eq!(2, replies.len());
        for (_, reply) in replies {
            assert_deadline(&reply.unwrap_err());
        }

        xclient.close();
        for server in servers {
            server.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn cancelling_the_caller_stops_a_broadcast() {
        let (servers, xclient) = two_sleepers().await;
        let users = UserServiceClient::new(xclient.clone());

        let ctx = Context::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let err = users
            .clone()
            .with_mode(CallMode::BroadcastFastest)
            .sleep(ctx, SLOW)
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Canceled, err.kind());
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());

        let ctx = Context::new();
        let canceller = ctx.clone();
        let replies = users
            .stub()
            .broadcast_all::<_, SleepReq>(ctx, "Sleep", &SLOW)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
        let start = Instant::now();
        let replies = replies.collect().await;
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
        assert_eq!(2, replies.len());
        for (_, reply) in replies {
            assert_eq!(ErrorKind::Canceled, reply.unwrap_err().kind());
        }

        xclient.close();
        for server in servers {
            server.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn broadcast_all_needs_its_own_entry_point() {
        let (servers, xclient) = three_instances_one_broken().await;
        let users = UserServiceClient::new(xclient.clone()).with_mode(CallMode::BroadcastAll);
        let err = users
            .get_by_id(Context::new(), GetByIdReq { id: 1 })
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Client, err.kind());

        xclient.close();
        for server in servers {
            server.close().await.unwrap();
        }
    }
}
