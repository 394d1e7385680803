use datajpa_core::db::open_db_in_memory;
use datajpa_core::model;
use datajpa_core::orm::{BulkMode, MappingError, ParamRef, QueryCompiler, QueryKind};
use datajpa_core::{session_factory, Managed, Member, MemberDto, OrmConfig, OrmError, Team};

#[test]
fn declarations_are_checked_against_mappings() {
    let metamodel = model::metamodel().unwrap();
    let compiler = QueryCompiler::for_entity::<Member>(&metamodel).unwrap();

    assert!(matches!(
        compiler.jpql("select m from Member m where m.nickname = :nickname"),
        Err(MappingError::UnknownAttribute { entity: "Member", .. })
    ));
    assert!(matches!(
        compiler.jpql("select m from Player m"),
        Err(MappingError::UnknownEntity { .. })
    ));
    assert!(matches!(
        compiler.derived("findByNickname"),
        Err(MappingError::UnknownAttribute { .. })
    ));
    assert!(matches!(
        compiler.jpql_projection::<MemberDto>("select new study.datajpa.dto.MemberDto(m.id) from Member m"),
        Err(MappingError::ProjectionMismatch { .. })
    ));
    assert!(matches!(
        compiler.graph("Member.nothing"),
        Err(MappingError::UnknownEntityGraph { .. })
    ));
}

#[test]
fn compiled_plan_reports_kind_and_parameters() {
    let metamodel = model::metamodel().unwrap();
    let compiler = QueryCompiler::for_entity::<Member>(&metamodel).unwrap();

    let plan = compiler
        .jpql("select m from Member m where m.username = :username and m.age = :age")
        .unwrap();
    assert_eq!(plan.kind(), QueryKind::Select);
    assert_eq!(plan.root_entity(), "Member");
    assert_eq!(
        plan.parameters(),
        [
            ParamRef::Named("username".to_string()),
            ParamRef::Named("age".to_string())
        ]
    );

    let derived = compiler.derived("findByUsernameAndAgeGreaterThan").unwrap();
    assert_eq!(
        derived.parameters(),
        [ParamRef::Positional(1), ParamRef::Positional(2)]
    );
    assert_eq!(compiler.derived("countByAge").unwrap().kind(), QueryKind::Select);
    assert_eq!(compiler.derived("existsByUsername").unwrap().kind(), QueryKind::Exists);
    assert_eq!(
        compiler.derived("deleteByUsername").unwrap().kind(),
        QueryKind::DerivedDelete
    );
}

#[test]
fn missing_parameter_and_wrong_terminal_fail_at_call() {
    let mut conn = open_db_in_memory().unwrap();
    let factory = session_factory(OrmConfig::default()).unwrap();
    let compiler = QueryCompiler::for_entity::<Member>(factory.metamodel()).unwrap();
    let find_user = compiler
        .jpql("select m from Member m where m.username = :username and m.age = :age")
        .unwrap();
    let bulk = compiler
        .jpql("update Member m set m.age = m.age + 1 where m.age >= :age")
        .unwrap();

    let mut session = factory.open_session(&mut conn).unwrap();
    session.persist(&Managed::new(Member::new("member1"))).unwrap();

    let err = session
        .query(&find_user)
        .bind("username", "member1")
        .list::<Member>()
        .unwrap_err();
    assert!(matches!(err, OrmError::MissingParameter(ref name) if name == ":age"));

    let err = session
        .query(&find_user)
        .bind("username", "member1")
        .bind("age", 0)
        .list::<Team>()
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidQueryUsage(_)));

    let err = session.query(&bulk).bind("age", 0).list::<Member>().unwrap_err();
    assert!(matches!(err, OrmError::InvalidQueryUsage(_)));

    let changed = session
        .query(&bulk)
        .bind("age", 0)
        .execute_update(BulkMode::ClearAfter)
        .unwrap();
    assert_eq!(changed, 1);
}
