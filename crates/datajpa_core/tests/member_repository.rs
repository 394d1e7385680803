use datajpa_core::db::open_db_in_memory;
use datajpa_core::orm::Direction;
use datajpa_core::{
    session_factory, BulkMode, CrudRepository, Entity, Managed, Member, MemberDto,
    MemberRepositoryCustom, OrmConfig, OrmError, PageRequest, Repositories, Session, Sort, Team,
};
use rusqlite::Connection;

fn setup() -> (Connection, datajpa_core::SessionFactory, Repositories) {
    let conn = open_db_in_memory().unwrap();
    let factory = session_factory(OrmConfig::default()).unwrap();
    let repos = Repositories::new(factory.metamodel()).unwrap();
    (conn, factory, repos)
}

fn save_member(session: &mut Session<'_>, repos: &Repositories, username: &str, age: i32) -> Managed<Member> {
    let member = Managed::new(Member::with_age(username, age));
    repos.members.save(session, &member).unwrap()
}

fn usernames(members: &[Managed<Member>]) -> Vec<String> {
    members
        .iter()
        .map(|member| member.borrow().username().to_string())
        .collect()
}

#[test]
fn save_then_find_by_id_returns_the_tracked_instance() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();

    let member = Managed::new(Member::new("memberA"));
    let saved = repos.members.save(&mut session, &member).unwrap();
    assert!(saved.ptr_eq(&member));
    let id = member.borrow().id().unwrap();

    let found = repos.members.find_by_id(&mut session, id).unwrap().unwrap();
    assert!(found.ptr_eq(&member));
    assert_eq!(found.borrow().username(), "memberA");
}

#[test]
fn reloaded_member_matches_saved_attributes() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let member = save_member(&mut session, &repos, "member1", 27);
    let id = member.borrow().id().unwrap();
    session.clear();

    let loaded = repos.members.find_by_id(&mut session, id).unwrap().unwrap();
    assert!(!loaded.ptr_eq(&member));
    let (saved, loaded) = (member.borrow(), loaded.borrow());
    assert_eq!(loaded.id(), saved.id());
    assert_eq!(loaded.username(), saved.username());
    assert_eq!(loaded.age(), saved.age());
    assert_eq!(loaded.version(), saved.version());
    assert_eq!(loaded.created_date(), saved.created_date());
    assert_eq!(loaded.updated_date(), saved.updated_date());
    assert!(loaded.created_date().is_some());
}

#[test]
fn basic_crud_counts_and_deletes() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let member1 = save_member(&mut session, &repos, "member1", 0);
    let member2 = save_member(&mut session, &repos, "member2", 0);

    let id1 = member1.borrow().id().unwrap();
    assert!(repos.members.exists_by_id(&mut session, id1).unwrap());
    assert_eq!(repos.members.find_all(&mut session).unwrap().len(), 2);
    assert_eq!(repos.members.count(&mut session).unwrap(), 2);

    repos.members.delete(&mut session, &member1).unwrap();
    repos.members.delete(&mut session, &member2).unwrap();
    assert_eq!(repos.members.count(&mut session).unwrap(), 0);
    assert!(repos.members.find_by_id(&mut session, id1).unwrap().is_none());
    session.commit().unwrap();

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM member", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn delete_all_and_batch_delete_empty_the_table() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    for name in ["a", "b", "c"] {
        save_member(&mut session, &repos, name, 1);
    }
    repos.members.delete_all(&mut session).unwrap();
    assert_eq!(repos.members.count(&mut session).unwrap(), 0);

    for name in ["d", "e"] {
        save_member(&mut session, &repos, name, 1);
    }
    let deleted = repos
        .members
        .delete_all_in_batch(&mut session, BulkMode::ClearAfter)
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(repos.members.count(&mut session).unwrap(), 0);
}

#[test]
fn find_all_by_id_and_sorted() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let first = save_member(&mut session, &repos, "member1", 10);
    save_member(&mut session, &repos, "member2", 20);
    let third = save_member(&mut session, &repos, "member3", 30);

    let ids = [first.borrow().id().unwrap(), third.borrow().id().unwrap()];
    let found = repos.members.find_all_by_id(&mut session, &ids).unwrap();
    assert_eq!(usernames(&found), ["member1", "member3"]);
    assert!(repos.members.find_all_by_id(&mut session, &[]).unwrap().is_empty());

    let sorted = repos
        .members
        .find_all_sorted(&mut session, Sort::desc("username"))
        .unwrap();
    assert_eq!(usernames(&sorted), ["member3", "member2", "member1"]);

    let err = repos
        .members
        .find_all_sorted(&mut session, Sort::asc("nickname"))
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidSortProperty { .. }));
}

#[test]
fn derived_and_query_matches_both_predicates() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    save_member(&mut session, &repos, "AAA", 10);
    let older = save_member(&mut session, &repos, "AAA", 20);
    save_member(&mut session, &repos, "BBB", 30);

    let result = repos
        .members
        .find_by_username_and_age_greater_than(&mut session, "AAA", 15)
        .unwrap();
    assert_eq!(result.len(), 1);
    assert!(result[0].ptr_eq(&older));
}

#[test]
fn derived_subjects_count_exists_top_and_delete() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    save_member(&mut session, &repos, "AAA", 10);
    save_member(&mut session, &repos, "AAA", 40);
    save_member(&mut session, &repos, "BBB", 20);
    save_member(&mut session, &repos, "CCC", 30);

    let top = repos.members.find_top3_by_age_desc(&mut session).unwrap();
    let ages: Vec<i32> = top.iter().map(|member| member.borrow().age()).collect();
    assert_eq!(ages, [40, 30, 20]);

    assert_eq!(repos.members.count_by_age(&mut session, 10).unwrap(), 1);
    assert!(repos.members.exists_by_username(&mut session, "BBB").unwrap());
    assert!(!repos.members.exists_by_username(&mut session, "ZZZ").unwrap());

    assert_eq!(repos.members.delete_by_username(&mut session, "AAA").unwrap(), 2);
    assert_eq!(repos.members.count(&mut session).unwrap(), 2);
}

#[test]
fn declared_query_binds_named_parameters() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let m1 = save_member(&mut session, &repos, "AAA", 10);
    save_member(&mut session, &repos, "BBB", 20);

    let result = repos.members.find_user(&mut session, "AAA", 10).unwrap();
    assert_eq!(result.len(), 1);
    assert!(result[0].ptr_eq(&m1));
}

#[test]
fn username_list_returns_scalars() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    save_member(&mut session, &repos, "AAA", 10);
    save_member(&mut session, &repos, "BBB", 20);

    let mut names = repos.members.find_username_list(&mut session).unwrap();
    names.sort();
    assert_eq!(names, ["AAA", "BBB"]);
}

#[test]
fn member_dto_projection_carries_team_name() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    let team = Managed::new(Team::new("teamA"));
    repos.teams.save(&mut session, &team).unwrap();
    let member = Member::with_team("AAA", 10, &team).unwrap();
    repos.members.save(&mut session, &member).unwrap();
    save_member(&mut session, &repos, "no-team", 10);

    let dtos = repos.members.find_member_dto(&mut session).unwrap();
    let id = member.borrow().id().unwrap();
    assert_eq!(dtos, [MemberDto::new(id, "AAA", Some("teamA".to_string()))]);

    let json = serde_json::to_value(&dtos[0]).unwrap();
    assert_eq!(
        json,
        serde_json::json!({ "id": id, "username": "AAA", "teamName": "teamA" })
    );
}

#[test]
fn in_list_parameter_expands_collection() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    save_member(&mut session, &repos, "AAA", 10);
    save_member(&mut session, &repos, "AAA", 20);
    save_member(&mut session, &repos, "CCC", 30);

    let result = repos.members.find_by_names(&mut session, &["AAA", "BBB"]).unwrap();
    assert_eq!(usernames(&result), ["AAA", "AAA"]);
    assert!(repos.members.find_by_names(&mut session, &[]).unwrap().is_empty());
}

#[test]
fn return_shapes_list_single_and_optional() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    save_member(&mut session, &repos, "AAA", 10);
    save_member(&mut session, &repos, "AAA", 20);
    let bbb = save_member(&mut session, &repos, "BBB", 30);

    assert_eq!(repos.members.find_list_by_username(&mut session, "AAA").unwrap().len(), 2);
    assert!(repos.members.find_list_by_username(&mut session, "ZZZ").unwrap().is_empty());

    let single = repos.members.find_member_by_username(&mut session, "BBB").unwrap();
    assert!(single.ptr_eq(&bbb));
    assert!(matches!(
        repos.members.find_member_by_username(&mut session, "ZZZ").unwrap_err(),
        OrmError::NoResult { .. }
    ));

    assert!(repos
        .members
        .find_optional_by_username(&mut session, "ZZZ")
        .unwrap()
        .is_none());
    assert!(matches!(
        repos.members.find_optional_by_username(&mut session, "AAA").unwrap_err(),
        OrmError::NonUniqueResult { count: 2, .. }
    ));
}

#[test]
fn paging_five_rows_by_three() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    for index in 1..=5 {
        save_member(&mut session, &repos, &format!("member{index}"), 10);
    }
    save_member(&mut session, &repos, "other", 20);

    let request = PageRequest::of(0, 3).with_sort(Sort::by(Direction::Desc, &["username"]));
    let page = repos.members.find_by_age(&mut session, 10, &request).unwrap();

    assert_eq!(page.content().len(), 3);
    assert_eq!(usernames(page.content()), ["member5", "member4", "member3"]);
    assert_eq!(page.total_elements(), 5);
    assert_eq!(page.number(), 0);
    assert_eq!(page.total_pages(), 2);
    assert!(page.is_first());
    assert!(page.has_next());

    let dtos = page.map(|member| {
        let member = member.borrow();
        MemberDto::new(member.id().unwrap(), member.username(), None)
    });
    assert_eq!(dtos.content()[0].username, "member5");
    assert_eq!(dtos.total_elements(), 5);
}

#[test]
fn last_partial_page_skips_count_query() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    for index in 1..=5 {
        save_member(&mut session, &repos, &format!("member{index}"), 10);
    }

    let before = session.stats().queries;
    let request = PageRequest::of(1, 3).with_sort(Sort::asc("username"));
    let page = repos.members.find_by_age(&mut session, 10, &request).unwrap();
    assert_eq!(session.stats().queries - before, 1);
    assert_eq!(usernames(page.content()), ["member4", "member5"]);
    assert_eq!(page.total_elements(), 5);
    assert!(page.is_last());
    assert!(!page.has_next());

    let before = session.stats().queries;
    let beyond = repos
        .members
        .find_by_age(&mut session, 10, &PageRequest::of(3, 3))
        .unwrap();
    assert_eq!(session.stats().queries - before, 2);
    assert!(beyond.content().is_empty());
    assert_eq!(beyond.total_elements(), 5);
}

#[test]
fn slice_fetches_one_extra_row() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    for index in 1..=5 {
        save_member(&mut session, &repos, &format!("member{index}"), 10);
    }

    let first = repos
        .members
        .find_slice_by_age(&mut session, 10, &PageRequest::of(0, 3))
        .unwrap();
    assert_eq!(first.content().len(), 3);
    assert!(first.has_next());

    let second = repos
        .members
        .find_slice_by_age(&mut session, 10, &PageRequest::of(1, 3))
        .unwrap();
    assert_eq!(second.content().len(), 2);
    assert!(!second.has_next());
}

fn save_bulk_fixture(session: &mut Session<'_>, repos: &Repositories) {
    for (name, age) in [
        ("member1", 10),
        ("member2", 19),
        ("member3", 20),
        ("member4", 21),
        ("member5", 40),
    ] {
        save_member(session, repos, name, age);
    }
}

#[test]
fn bulk_update_marks_tracked_instances_stale() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    save_bulk_fixture(&mut session, &repos);

    let affected = repos
        .members
        .bulk_age_plus(&mut session, 20, BulkMode::MarkStale)
        .unwrap();
    assert_eq!(affected, 3);

    let err = repos
        .members
        .find_member_by_username(&mut session, "member5")
        .unwrap_err();
    assert!(matches!(err, OrmError::EvictionRequired { .. }));

    session.clear();
    let member5 = repos.members.find_member_by_username(&mut session, "member5").unwrap();
    assert_eq!(member5.borrow().age(), 41);
}

#[test]
fn bulk_update_can_clear_the_session() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    save_bulk_fixture(&mut session, &repos);

    let affected = repos
        .members
        .bulk_age_plus(&mut session, 20, BulkMode::ClearAfter)
        .unwrap();
    assert_eq!(affected, 3);

    let member5 = repos.members.find_member_by_username(&mut session, "member5").unwrap();
    assert_eq!(member5.borrow().age(), 41);
    let member2 = repos.members.find_member_by_username(&mut session, "member2").unwrap();
    assert_eq!(member2.borrow().age(), 19);
}

#[test]
fn custom_fragment_is_composed_into_repository() {
    let (mut conn, factory, repos) = setup();
    let mut session = factory.open_session(&mut conn).unwrap();
    save_member(&mut session, &repos, "member1", 10);
    save_member(&mut session, &repos, "member2", 20);

    let result = repos.members.find_member_custom(&mut session).unwrap();
    assert_eq!(result.len(), 2);
}
